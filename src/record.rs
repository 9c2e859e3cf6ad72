//! Data-record decoding.
//!
//! A data record is the concatenation of every channel's sample block.
//! EDF stores little-endian 16-bit samples, BDF 24-bit; both are
//! two's-complement and must be sign-extended before conversion.
//! Annotation channels are not sampled data: their bytes go through the
//! TAL parser, and their record-start timestamps drive discontinuity
//! detection.

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::annotation::parse_tal_record;
use crate::error::{ReadError, Result};
use crate::gaps::GapEntry;
use crate::types::{Annotation, Header, SignalSpec};
use crate::utils::approx_eq_ulps;

const START_ULPS: u64 = 16;

/// Result of decoding a contiguous span of data records.
#[derive(Debug)]
pub struct DecodedRecords {
    /// Physical samples per channel, concatenated across records.
    /// Annotation channels contribute empty vectors.
    pub samples: Vec<Vec<f32>>,
    /// Annotations from every annotation channel, in record order.
    pub annotations: Vec<Annotation>,
    /// Gaps discovered from late record starts.
    pub gaps: Vec<GapEntry>,
    /// TAL record-start timestamp per record, from the first annotation
    /// channel; `None` when the recording has no annotation channel.
    pub record_starts: Vec<Option<f64>>,
    /// Gap time accumulated up to the end of the decoded span.
    pub prior_gap: f64,
}

/// Decodes `record_count` data records beginning at absolute record
/// index `first_record`. `buffer` must cover the span exactly;
/// `prior_gap` is the total gap time before `first_record`, used to
/// compute expected record starts.
pub fn decode(
    header: &Header,
    signals: &[SignalSpec],
    buffer: &[u8],
    first_record: usize,
    record_count: usize,
    prior_gap: f64,
) -> Result<DecodedRecords> {
    if header.data_record_duration <= 0.0 {
        return Err(ReadError::MalformedHeader(
            "data record duration is zero".to_string(),
        ));
    }
    let expected_len = record_count * header.record_byte_size;
    if buffer.len() != expected_len {
        return Err(ReadError::ShortRead {
            expected: expected_len,
            got: buffer.len(),
        });
    }

    let bytes_per_sample = header.format.bytes_per_sample();
    let mut out = DecodedRecords {
        samples: signals
            .iter()
            .map(|s| {
                if s.is_annotation {
                    Vec::new()
                } else {
                    Vec::with_capacity(s.samples_per_record * record_count)
                }
            })
            .collect(),
        annotations: Vec::new(),
        gaps: Vec::new(),
        record_starts: vec![None; record_count],
        prior_gap,
    };

    let mut accumulated_gap = prior_gap;
    // Once an overlapping record start has been reported, subsequent
    // expectations are corrected so one bad clock does not warn per record.
    let mut start_correction = 0.0;

    for r in 0..record_count {
        let record = &buffer[r * header.record_byte_size..(r + 1) * header.record_byte_size];
        let absolute = first_record + r;
        let expected = absolute as f64 * header.data_record_duration + accumulated_gap;

        let mut offset = 0;
        let mut saw_annotation_channel = false;
        for (ch, spec) in signals.iter().enumerate() {
            let block_len = spec.samples_per_record * bytes_per_sample;
            let block = &record[offset..offset + block_len];
            offset += block_len;

            if spec.is_annotation {
                let tal = parse_tal_record(block)?;
                if !saw_annotation_channel {
                    saw_annotation_channel = true;
                    out.record_starts[r] = Some(tal.record_start);
                    let adjusted = expected + start_correction;
                    if !approx_eq_ulps(tal.record_start, adjusted, START_ULPS) {
                        if tal.record_start > adjusted {
                            if header.discontinuous {
                                let duration = tal.record_start - adjusted;
                                out.gaps.push(GapEntry {
                                    data_time: absolute as f64 * header.data_record_duration,
                                    duration,
                                });
                                accumulated_gap += duration;
                            }
                        } else {
                            // Overlap is a warning, not a failure; the
                            // correction keeps one skewed clock from
                            // warning on every following record.
                            let overlap = adjusted - tal.record_start;
                            warn!(
                                "{}",
                                ReadError::CorruptedRecord {
                                    record: absolute,
                                    overlap,
                                }
                            );
                            start_correction -= overlap;
                        }
                    }
                }
                out.annotations.extend(tal.annotations);
            } else {
                decode_samples(block, spec, bytes_per_sample, &mut out.samples[ch]);
            }
        }
    }

    out.prior_gap = accumulated_gap;
    Ok(out)
}

/// Decodes one channel block, converting digital to physical in a
/// single pass.
fn decode_samples(block: &[u8], spec: &SignalSpec, bytes_per_sample: usize, out: &mut Vec<f32>) {
    let units_per_bit = spec.units_per_bit();
    let digital_offset = spec.digital_offset();
    for raw in block.chunks_exact(bytes_per_sample) {
        let digital = match bytes_per_sample {
            2 => LittleEndian::read_i16(raw) as i32,
            _ => LittleEndian::read_i24(raw),
        };
        let physical = units_per_bit * (digital as f64 + digital_offset);
        out.push(physical as f32);
    }
}
