//! Fixed-width ASCII header parsing for EDF and BDF recordings.
//!
//! The header record is `256 * (signal_count + 1)` bytes: a 256-byte
//! prologue followed by per-signal field blocks where each field is
//! repeated for every signal before the next field begins.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use log::warn;

use crate::error::{ReadError, Result};
use crate::types::{DataFormat, Header, SignalSpec};
use crate::utils::{field_str, parse_float, parse_int};

/// Size of the prologue and of each per-signal block.
pub const HEADER_BLOCK_BYTES: usize = 256;

/// Reads the signal count out of the 256-byte prologue, so the caller
/// can size the second read before parsing the full header.
pub fn parse_signal_count(prologue: &[u8]) -> Result<usize> {
    if prologue.len() < HEADER_BLOCK_BYTES {
        return Err(ReadError::ShortRead {
            expected: HEADER_BLOCK_BYTES,
            got: prologue.len(),
        });
    }
    let count = parse_int(&field_str(prologue, 252, 4))
        .ok_or_else(|| ReadError::MalformedHeader("signal count missing".to_string()))?;
    if count < 1 || count as usize > crate::MAX_SIGNALS {
        return Err(ReadError::MalformedHeader(format!(
            "signal count {} out of range",
            count
        )));
    }
    Ok(count as usize)
}

/// Parses the complete header record into a [`Header`] and its
/// [`SignalSpec`] list. `bytes` must hold at least
/// `256 * (signal_count + 1)` bytes.
pub fn parse(bytes: &[u8]) -> Result<(Header, Vec<SignalSpec>)> {
    let signal_count = parse_signal_count(bytes)?;
    let needed = HEADER_BLOCK_BYTES * (signal_count + 1);
    if bytes.len() < needed {
        return Err(ReadError::ShortRead {
            expected: needed,
            got: bytes.len(),
        });
    }

    let reserved = field_str(bytes, 192, 44);
    let format = detect_format(bytes, &reserved)?;
    let discontinuous = format.is_plus() && reserved.as_bytes().get(4) == Some(&b'D');

    let patient_id = field_str(bytes, 8, 80);
    let recording_id = field_str(bytes, 88, 80);
    let start = parse_start(&field_str(bytes, 168, 8), &field_str(bytes, 176, 8));

    let header_record_bytes = parse_int(&field_str(bytes, 184, 8))
        .filter(|&v| v > 0)
        .ok_or_else(|| ReadError::MalformedHeader("header byte count missing".to_string()))?
        as usize;
    if header_record_bytes != needed {
        warn!(
            "header record reports {} bytes, layout implies {}",
            header_record_bytes, needed
        );
    }

    let data_record_count = parse_int(&field_str(bytes, 236, 8))
        .filter(|&v| v > 0)
        .ok_or_else(|| {
            ReadError::MalformedHeader("data record count missing or not positive".to_string())
        })? as usize;

    let data_record_duration = parse_float(&field_str(bytes, 244, 8))
        .filter(|&v| v > 0.0)
        .ok_or_else(|| {
            ReadError::MalformedHeader("data record duration missing or zero".to_string())
        })?;

    let signals = parse_signals(
        &bytes[HEADER_BLOCK_BYTES..needed],
        signal_count,
        format,
        data_record_duration,
    )?;

    let record_byte_size = signals
        .iter()
        .map(|s| s.samples_per_record * format.bytes_per_sample())
        .sum();

    let header = Header {
        format,
        discontinuous,
        patient_id,
        recording_id,
        start,
        header_record_bytes,
        data_record_count,
        data_record_duration,
        signal_count,
        record_byte_size,
        reserved,
    };
    Ok((header, signals))
}

fn detect_format(bytes: &[u8], reserved: &str) -> Result<DataFormat> {
    let is_plus = {
        let prefix = reserved.get(..4).unwrap_or("");
        prefix.eq_ignore_ascii_case("EDF+") || prefix.eq_ignore_ascii_case("BDF+")
    };

    if field_str(bytes, 0, 8) == "0" {
        return Ok(if is_plus {
            DataFormat::EdfPlus
        } else {
            DataFormat::Edf
        });
    }
    if bytes[0] == 0xFF && field_str(bytes, 1, 7) == "BIOSEMI" {
        return Ok(if is_plus {
            DataFormat::BdfPlus
        } else {
            DataFormat::Bdf
        });
    }
    Err(ReadError::MalformedHeader(
        "unsupported data format identifier".to_string(),
    ))
}

/// Parses `dd.mm.yy` / `hh.mm.ss` with the two-digit year pivot at 85.
/// Failure is logged and yields `None`; a missing timestamp does not make
/// the recording unreadable.
fn parse_start(date: &str, time: &str) -> Option<NaiveDateTime> {
    let parsed = (|| {
        let mut d = date.split('.');
        let day: u32 = d.next()?.trim().parse().ok()?;
        let month: u32 = d.next()?.trim().parse().ok()?;
        let yy: i32 = d.next()?.trim().parse().ok()?;
        let year = if yy >= 85 { 1900 + yy } else { 2000 + yy };

        let mut t = time.split('.');
        let hour: u32 = t.next()?.trim().parse().ok()?;
        let minute: u32 = t.next()?.trim().parse().ok()?;
        let second: u32 = t.next()?.trim().parse().ok()?;

        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let time = NaiveTime::from_hms_opt(hour, minute, second)?;
        Some(NaiveDateTime::new(date, time))
    })();
    if parsed.is_none() {
        warn!("unparseable recording start '{}' '{}'", date, time);
    }
    parsed
}

fn parse_signals(
    blocks: &[u8],
    n: usize,
    format: DataFormat,
    record_duration: f64,
) -> Result<Vec<SignalSpec>> {
    // Field blocks: label(16), transducer(80), unit(8), phys_min(8),
    // phys_max(8), dig_min(8), dig_max(8), prefilter(80), samples(8),
    // reserved(32); each repeated n times before the next begins.
    let off = |base: usize, width: usize, i: usize| base * n + i * width;

    let mut signals = Vec::with_capacity(n);
    for i in 0..n {
        let label = field_str(blocks, off(0, 16, i), 16);
        let is_annotation =
            format.is_plus() && label.eq_ignore_ascii_case(format.annotation_label());

        let transducer = field_str(blocks, off(16, 80, i), 80);
        let physical_unit = field_str(blocks, off(96, 8, i), 8);
        let physical_min = parse_float(&field_str(blocks, off(104, 8, i), 8))
            .ok_or_else(|| bad_signal_field(i, "physical minimum"))?;
        let physical_max = parse_float(&field_str(blocks, off(112, 8, i), 8))
            .ok_or_else(|| bad_signal_field(i, "physical maximum"))?;
        let digital_min = parse_int(&field_str(blocks, off(120, 8, i), 8))
            .ok_or_else(|| bad_signal_field(i, "digital minimum"))? as i32;
        let digital_max = parse_int(&field_str(blocks, off(128, 8, i), 8))
            .ok_or_else(|| bad_signal_field(i, "digital maximum"))? as i32;
        let prefiltering = field_str(blocks, off(136, 80, i), 80);
        let samples_per_record = parse_int(&field_str(blocks, off(216, 8, i), 8))
            .filter(|&v| v > 0)
            .ok_or_else(|| bad_signal_field(i, "sample count"))? as usize;
        let reserved = field_str(blocks, off(224, 32, i), 32);

        if !is_annotation {
            if digital_min == digital_max {
                return Err(bad_signal_field(i, "digital range (min equals max)"));
            }
            if physical_min == physical_max {
                return Err(bad_signal_field(i, "physical range (min equals max)"));
            }
        }

        let sampling_rate = if is_annotation {
            0.0
        } else {
            samples_per_record as f64 / record_duration
        };

        signals.push(SignalSpec {
            label,
            transducer,
            physical_unit,
            prefiltering,
            reserved,
            digital_min,
            digital_max,
            physical_min,
            physical_max,
            samples_per_record,
            sampling_rate,
            is_annotation,
        });
    }
    Ok(signals)
}

fn bad_signal_field(index: usize, field: &str) -> ReadError {
    ReadError::MalformedHeader(format!("signal {}: invalid {}", index, field))
}
