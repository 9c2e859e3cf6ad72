use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// On-disk sample format family of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    #[serde(rename = "edf")]
    Edf,
    #[serde(rename = "edf+")]
    EdfPlus,
    #[serde(rename = "bdf")]
    Bdf,
    #[serde(rename = "bdf+")]
    BdfPlus,
}

impl DataFormat {
    pub fn is_plus(&self) -> bool {
        matches!(self, DataFormat::EdfPlus | DataFormat::BdfPlus)
    }

    /// Stored sample width: 16-bit for EDF, 24-bit for BDF.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            DataFormat::Edf | DataFormat::EdfPlus => 2,
            DataFormat::Bdf | DataFormat::BdfPlus => 3,
        }
    }

    /// Growth factor from stored samples to 32-bit cache samples.
    pub fn widen_factor(&self) -> f64 {
        match self {
            DataFormat::Edf | DataFormat::EdfPlus => 2.0,
            DataFormat::Bdf | DataFormat::BdfPlus => 4.0 / 3.0,
        }
    }

    pub fn annotation_label(&self) -> &'static str {
        match self {
            DataFormat::Edf | DataFormat::EdfPlus => "EDF Annotations",
            DataFormat::Bdf | DataFormat::BdfPlus => "BDF Annotations",
        }
    }
}

/// Parsed recording header. Immutable after parse.
#[derive(Debug, Clone)]
pub struct Header {
    pub format: DataFormat,
    pub discontinuous: bool,
    pub patient_id: String,
    pub recording_id: String,
    /// Start of the recording in the local calendar; `None` when the
    /// date/time fields fail to parse (logged, not fatal).
    pub start: Option<NaiveDateTime>,
    /// Byte offset of the first data record.
    pub header_record_bytes: usize,
    pub data_record_count: usize,
    /// Duration of one data record in seconds, always > 0.
    pub data_record_duration: f64,
    pub signal_count: usize,
    /// Byte size of one data record across all channels.
    pub record_byte_size: usize,
    pub reserved: String,
}

impl Header {
    /// Recording length without gaps: record count times record duration.
    pub fn data_length(&self) -> f64 {
        self.data_record_count as f64 * self.data_record_duration
    }

    /// Byte offset of data record `index`.
    pub fn record_offset(&self, index: usize) -> u64 {
        self.header_record_bytes as u64 + index as u64 * self.record_byte_size as u64
    }
}

/// Per-channel signal description with derived conversion parameters.
#[derive(Debug, Clone)]
pub struct SignalSpec {
    pub label: String,
    pub transducer: String,
    pub physical_unit: String,
    pub prefiltering: String,
    pub reserved: String,
    pub digital_min: i32,
    pub digital_max: i32,
    pub physical_min: f64,
    pub physical_max: f64,
    /// Samples contributed to each data record.
    pub samples_per_record: usize,
    /// Samples per second; pinned to 0.0 for annotation channels.
    pub sampling_rate: f64,
    pub is_annotation: bool,
}

impl SignalSpec {
    /// Physical units represented by one digital step.
    pub fn units_per_bit(&self) -> f64 {
        (self.physical_max - self.physical_min) / (self.digital_max - self.digital_min) as f64
    }

    /// Offset applied to digital values before scaling.
    pub fn digital_offset(&self) -> f64 {
        self.physical_max / self.units_per_bit() - self.digital_max as f64
    }

    /// Converts a digital sample to its physical value.
    pub fn to_physical(&self, digital: i32) -> f64 {
        self.units_per_bit() * (digital as f64 + self.digital_offset())
    }
}

/// A single event parsed from an annotation channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Onset in recording time, seconds.
    pub start: f64,
    /// Duration in seconds, 0 for instantaneous events.
    pub duration: f64,
    pub label: String,
    /// Channels the event applies to; `None` means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<usize>>,
    #[serde(default = "Annotation::default_class")]
    pub class: String,
}

impl Annotation {
    pub fn new(start: f64, duration: f64, label: impl Into<String>) -> Self {
        Self {
            start,
            duration,
            label: label.into(),
            channels: None,
            class: Self::default_class(),
        }
    }

    fn default_class() -> String {
        "event".to_string()
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// A recording-time interruption between data records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataGap {
    /// Recording time at which the gap opens.
    pub start: f64,
    pub duration: f64,
}

/// Time on the contiguous cache axis (recording time minus preceding
/// gaps). Only `GapModel` converts between the two axes.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct CacheTime(pub f64);

/// Wall-clock offset from recording start, gaps included.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct RecordingTime(pub f64);

/// Half-open-ish time interval in seconds. Used for both clock domains;
/// which one is meant is determined by the API taking it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }

    /// Covering check with a small tolerance for float round-off at the
    /// edges of sample-aligned ranges.
    pub fn covers(&self, other: &TimeRange) -> bool {
        const EPS: f64 = 1e-9;
        self.start <= other.start + EPS && self.end >= other.end - EPS
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if end > start {
            Some(TimeRange { start, end })
        } else {
            None
        }
    }

    pub fn clamp_to(&self, bound: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.max(bound.start),
            end: self.end.min(bound.end),
        }
    }
}

/// Summary handed back once a study is set up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Study {
    pub format: DataFormat,
    /// Seconds of actual signal data (gaps excluded).
    pub data_length: f64,
    /// Total recording span including gaps.
    pub recording_length: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> SignalSpec {
        SignalSpec {
            label: "EEG Fpz-Cz".to_string(),
            transducer: "AgAgCl electrode".to_string(),
            physical_unit: "uV".to_string(),
            prefiltering: "HP:0.1Hz LP:75Hz".to_string(),
            reserved: String::new(),
            digital_min: -32768,
            digital_max: 32767,
            physical_min: -200.0,
            physical_max: 200.0,
            samples_per_record: 256,
            sampling_rate: 256.0,
            is_annotation: false,
        }
    }

    #[test]
    fn test_physical_conversion_matches_textbook_form() {
        let spec = test_spec();
        for &d in &[-32768, -1, 0, 1, 12345, 32767] {
            let direct = spec.to_physical(d);
            let textbook = (d - spec.digital_min) as f64
                / (spec.digital_max - spec.digital_min) as f64
                * (spec.physical_max - spec.physical_min)
                + spec.physical_min;
            assert!(
                crate::utils::approx_eq_ulps(direct, textbook, 16),
                "digital {} -> {} vs {}",
                d,
                direct,
                textbook
            );
        }
    }

    #[test]
    fn test_range_covers_with_tolerance() {
        let a = TimeRange::new(0.0, 10.0);
        assert!(a.covers(&TimeRange::new(0.0, 10.0)));
        assert!(a.covers(&TimeRange::new(2.0, 4.0)));
        assert!(a.covers(&TimeRange::new(-1e-12, 10.0)));
        assert!(!a.covers(&TimeRange::new(2.0, 10.5)));
    }

    #[test]
    fn test_record_offset() {
        let header = Header {
            format: DataFormat::Edf,
            discontinuous: false,
            patient_id: String::new(),
            recording_id: String::new(),
            start: None,
            header_record_bytes: 768,
            data_record_count: 10,
            data_record_duration: 1.0,
            signal_count: 2,
            record_byte_size: 1024,
            reserved: String::new(),
        };
        assert_eq!(header.record_offset(0), 768);
        assert_eq!(header.record_offset(3), 768 + 3 * 1024);
        assert_eq!(header.data_length(), 10.0);
    }
}
