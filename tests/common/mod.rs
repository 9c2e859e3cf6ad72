//! Builders for synthetic EDF/BDF byte images.
//!
//! The crate only reads recordings, so the tests assemble the on-disk
//! layout by hand: a space-padded ASCII header followed by data records
//! in which every channel contributes its block of little-endian
//! samples (or TAL bytes for annotation channels).

#![allow(dead_code)]

/// One channel of a synthetic recording.
#[derive(Clone)]
pub struct TestSignal {
    pub label: String,
    pub physical_min: f64,
    pub physical_max: f64,
    pub digital_min: i32,
    pub digital_max: i32,
    pub samples_per_record: usize,
}

impl TestSignal {
    pub fn eeg(label: &str, samples_per_record: usize) -> Self {
        Self {
            label: label.to_string(),
            physical_min: -100.0,
            physical_max: 100.0,
            digital_min: -32768,
            digital_max: 32767,
            samples_per_record,
        }
    }

    /// An EDF+ annotation channel with room for `samples_per_record`
    /// two-byte samples of TAL text.
    pub fn annotations(samples_per_record: usize) -> Self {
        Self {
            label: "EDF Annotations".to_string(),
            physical_min: -1.0,
            physical_max: 1.0,
            digital_min: -32768,
            digital_max: 32767,
            samples_per_record,
        }
    }

    pub fn bdf_annotations(samples_per_record: usize) -> Self {
        Self {
            label: "BDF Annotations".to_string(),
            ..Self::annotations(samples_per_record)
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum TestFormat {
    Edf,
    EdfPlusC,
    EdfPlusD,
    Bdf,
}

impl TestFormat {
    fn version_bytes(&self) -> [u8; 8] {
        match self {
            TestFormat::Bdf => *b"\xFFBIOSEMI",
            _ => *b"0       ",
        }
    }

    fn reserved(&self) -> &'static str {
        match self {
            TestFormat::Edf | TestFormat::Bdf => "",
            TestFormat::EdfPlusC => "EDF+C",
            TestFormat::EdfPlusD => "EDF+D",
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            TestFormat::Bdf => 3,
            _ => 2,
        }
    }
}

pub struct TestRecording {
    pub format: TestFormat,
    pub record_duration: f64,
    pub signals: Vec<TestSignal>,
}

impl TestRecording {
    pub fn record_byte_size(&self) -> usize {
        self.signals
            .iter()
            .map(|s| s.samples_per_record * self.format.bytes_per_sample())
            .sum()
    }

    /// Assembles the full byte image. `records[r][ch]` holds the raw
    /// channel block; blocks shorter than the channel's size are padded
    /// with NUL bytes (useful for TAL payloads).
    pub fn bytes(&self, records: &[Vec<Vec<u8>>]) -> Vec<u8> {
        let mut out = self.header_bytes(records.len());
        for record in records {
            assert_eq!(record.len(), self.signals.len(), "channel count mismatch");
            for (ch, block) in record.iter().enumerate() {
                let want = self.signals[ch].samples_per_record * self.format.bytes_per_sample();
                assert!(
                    block.len() <= want,
                    "channel {} block is {} bytes, limit {}",
                    ch,
                    block.len(),
                    want
                );
                out.extend_from_slice(block);
                out.resize(out.len() + want - block.len(), 0);
            }
        }
        out
    }

    pub fn header_bytes(&self, record_count: usize) -> Vec<u8> {
        let n = self.signals.len();
        let mut h = Vec::with_capacity(256 * (n + 1));
        h.extend_from_slice(&self.format.version_bytes());
        push_field(&mut h, "X X X X", 80);
        push_field(&mut h, "Startdate 02-AUG-2023 X X X", 80);
        push_field(&mut h, "02.08.23", 8);
        push_field(&mut h, "21.30.00", 8);
        push_field(&mut h, &format!("{}", 256 * (n + 1)), 8);
        push_field(&mut h, self.format.reserved(), 44);
        push_field(&mut h, &format!("{}", record_count), 8);
        push_field(&mut h, &format_duration(self.record_duration), 8);
        push_field(&mut h, &format!("{}", n), 4);

        for s in &self.signals {
            push_field(&mut h, &s.label, 16);
        }
        for _ in &self.signals {
            push_field(&mut h, "test transducer", 80);
        }
        for s in &self.signals {
            let unit = if s.label.contains("Annotations") { "" } else { "uV" };
            push_field(&mut h, unit, 8);
        }
        for s in &self.signals {
            push_field(&mut h, &format!("{}", s.physical_min), 8);
        }
        for s in &self.signals {
            push_field(&mut h, &format!("{}", s.physical_max), 8);
        }
        for s in &self.signals {
            push_field(&mut h, &format!("{}", s.digital_min), 8);
        }
        for s in &self.signals {
            push_field(&mut h, &format!("{}", s.digital_max), 8);
        }
        for _ in &self.signals {
            push_field(&mut h, "", 80);
        }
        for s in &self.signals {
            push_field(&mut h, &format!("{}", s.samples_per_record), 8);
        }
        for _ in &self.signals {
            push_field(&mut h, "", 32);
        }
        assert_eq!(h.len(), 256 * (n + 1));
        h
    }
}

fn format_duration(d: f64) -> String {
    if d.fract() == 0.0 {
        format!("{}", d as i64)
    } else {
        format!("{}", d)
    }
}

pub fn push_field(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    assert!(bytes.len() <= width, "field '{}' wider than {}", value, width);
    out.extend_from_slice(bytes);
    out.resize(out.len() + width - bytes.len(), b' ');
}

/// Little-endian 16-bit channel block.
pub fn i16_block(values: &[i16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// A block of `count` identical 16-bit samples.
pub fn const_i16_block(value: i16, count: usize) -> Vec<u8> {
    i16_block(&vec![value; count])
}

/// Little-endian 24-bit channel block from sign-extended values.
pub fn i24_block(values: &[i32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|v| v.to_le_bytes()[..3].to_vec())
        .collect()
}

/// TAL bytes: the record-start marker plus optional annotation entries
/// `(onset, duration, label)`. A zero duration is written without the
/// duration field, matching instantaneous events.
pub fn tal_block(record_start: f64, entries: &[(f64, f64, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format_onset(record_start).as_bytes());
    out.extend_from_slice(&[0x14, 0x14, 0x00]);
    for (onset, duration, label) in entries {
        out.extend_from_slice(format_onset(*onset).as_bytes());
        if *duration > 0.0 {
            out.push(0x15);
            out.extend_from_slice(format_number(*duration).as_bytes());
        }
        out.push(0x14);
        out.extend_from_slice(label.as_bytes());
        out.extend_from_slice(&[0x14, 0x00]);
    }
    out
}

fn format_onset(t: f64) -> String {
    if t < 0.0 {
        format_number(t)
    } else {
        format!("+{}", format_number(t))
    }
}

fn format_number(t: f64) -> String {
    if t.fract() == 0.0 {
        format!("{}", t as i64)
    } else {
        format!("{}", t)
    }
}

/// Digital value converted through a signal's calibration, the same
/// way the reader does it.
pub fn physical_of(signal: &TestSignal, digital: i32) -> f64 {
    let units = (signal.physical_max - signal.physical_min)
        / (signal.digital_max - signal.digital_min) as f64;
    let offset = signal.physical_max / units - signal.digital_max as f64;
    units * (digital as f64 + offset)
}
