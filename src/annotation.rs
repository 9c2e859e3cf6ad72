//! Timestamped Annotation List (TAL) parsing.
//!
//! Annotation channels carry UTF-8 text structured by three sentinel
//! bytes: 0x14 closes a timestamp or text field, 0x15 separates onset
//! from duration, and NUL terminates an entry (and pads the record).
//! Every data record opens with a bare timestamp (`onset 0x14 0x14`)
//! marking when the record starts; the entries that follow are events.

use crate::error::{ReadError, Result};
use crate::types::Annotation;
use crate::utils::parse_float;

const FIELD_END: u8 = 0x14;
const DURATION_SEP: u8 = 0x15;

/// One decoded annotation-channel slice of a data record.
#[derive(Debug, Clone, PartialEq)]
pub struct TalRecord {
    /// Onset of the data record itself, in recording time.
    pub record_start: f64,
    /// Events in the record; one per non-empty text field.
    pub annotations: Vec<Annotation>,
}

/// Parses the annotation-channel bytes of one data record.
///
/// The scan stops at two consecutive NUL bytes or at the end of the
/// slice. Unparseable onset or duration fields fail the record with
/// [`ReadError::MalformedAnnotation`].
pub fn parse_tal_record(bytes: &[u8]) -> Result<TalRecord> {
    let mut scan = Scanner { bytes, pos: 0 };

    let record_start = scan.parse_record_start()?;
    let mut annotations = Vec::new();

    // Every entry consumes its own terminating NUL, so a NUL here is the
    // start of the record padding: two consecutive NULs in the stream.
    loop {
        match scan.peek() {
            None | Some(0) => break,
            Some(_) => scan.parse_tal(&mut annotations)?,
        }
    }

    Ok(TalRecord {
        record_start,
        annotations,
    })
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Advances to the next occurrence of any sentinel, returning the
    /// passed-over bytes.
    fn take_until_sentinel(&mut self) -> &'a [u8] {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == FIELD_END || b == DURATION_SEP || b == 0 {
                break;
            }
            self.pos += 1;
        }
        &self.bytes[start..self.pos]
    }

    fn expect(&mut self, byte: u8, what: &str) -> Result<()> {
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            other => Err(ReadError::MalformedAnnotation(format!(
                "expected {} at byte {}, found {:?}",
                what, self.pos, other
            ))),
        }
    }

    /// `onset 0x14 0x14`, the record-start marker. Writers usually
    /// close it with a NUL like any other entry; consume one if present.
    fn parse_record_start(&mut self) -> Result<f64> {
        let onset = self.parse_time("record start")?;
        self.expect(FIELD_END, "record start terminator")?;
        self.expect(FIELD_END, "record start terminator")?;
        if self.peek() == Some(0) {
            self.pos += 1;
        }
        Ok(onset)
    }

    /// `onset [0x15 duration] 0x14 text {0x14 text} 0x14 0x00`
    fn parse_tal(&mut self, out: &mut Vec<Annotation>) -> Result<()> {
        let start = self.parse_time("annotation onset")?;

        let duration = if self.peek() == Some(DURATION_SEP) {
            self.pos += 1;
            self.parse_time("annotation duration")?
        } else {
            0.0
        };

        self.expect(FIELD_END, "onset terminator")?;

        // Text fields until the NUL entry terminator. Each non-empty
        // field becomes its own annotation sharing onset and duration.
        loop {
            let text = self.take_until_sentinel();
            match self.peek() {
                Some(FIELD_END) => self.pos += 1,
                Some(0) => {
                    self.pos += 1;
                    break;
                }
                Some(DURATION_SEP) => {
                    return Err(ReadError::MalformedAnnotation(format!(
                        "stray duration separator at byte {}",
                        self.pos
                    )));
                }
                None => break,
                Some(b) => unreachable!(
                    "take_until_sentinel only stops at FIELD_END, DURATION_SEP, 0, or end: got {}",
                    b
                ),
            }
            if !text.is_empty() {
                let label = String::from_utf8_lossy(text).into_owned();
                out.push(Annotation::new(start, duration.max(0.0), label));
            }
            if self.peek() == Some(0) {
                self.pos += 1;
                break;
            }
        }
        Ok(())
    }

    /// Signed decimal seconds. Conformant writers always sign onsets;
    /// the sign is treated as optional for tolerance.
    fn parse_time(&mut self, what: &str) -> Result<f64> {
        let raw = self.take_until_sentinel();
        let text = std::str::from_utf8(raw)
            .map_err(|_| ReadError::MalformedAnnotation(format!("non-UTF-8 {}", what)))?;
        parse_float(text)
            .ok_or_else(|| ReadError::MalformedAnnotation(format!("unparseable {}: {:?}", what, text)))
    }
}

/// Flat annotation list kept sorted by onset.
///
/// Range queries bisect instead of scanning, and re-decoded records can
/// re-announce their events without duplicating them.
#[derive(Debug, Default)]
pub struct AnnotationStore {
    items: Vec<Annotation>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn insert(&mut self, annotation: Annotation) {
        // Insert after the run of equal onsets so decode order is kept
        // for simultaneous events.
        let pos = self
            .items
            .partition_point(|a| a.start <= annotation.start);
        let duplicate = self.items[..pos]
            .iter()
            .rev()
            .take_while(|a| a.start == annotation.start)
            .any(|a| a.duration == annotation.duration && a.label == annotation.label);
        if !duplicate {
            self.items.insert(pos, annotation);
        }
    }

    pub fn extend(&mut self, annotations: impl IntoIterator<Item = Annotation>) {
        for a in annotations {
            self.insert(a);
        }
    }

    /// Annotations with onset in `[range.start, range.end)`.
    pub fn query(&self, range: &crate::types::TimeRange) -> Vec<Annotation> {
        let from = self.items.partition_point(|a| a.start < range.start);
        let to = self.items.partition_point(|a| a.start < range.end);
        self.items[from..to].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeRange;

    #[test]
    fn test_store_sorts_and_dedups() {
        let mut store = AnnotationStore::new();
        store.insert(Annotation::new(3.0, 0.0, "B"));
        store.insert(Annotation::new(1.0, 0.0, "A"));
        store.insert(Annotation::new(3.0, 0.0, "B"));
        store.insert(Annotation::new(3.0, 1.0, "B"));
        assert_eq!(store.len(), 3);
        let all = store.query(&TimeRange::new(0.0, 10.0));
        assert_eq!(all[0].label, "A");
        assert_eq!(all[1].start, 3.0);
    }

    #[test]
    fn test_store_query_bounds() {
        let mut store = AnnotationStore::new();
        for i in 0..5 {
            store.insert(Annotation::new(i as f64, 0.0, format!("a{}", i)));
        }
        let hits = store.query(&TimeRange::new(1.0, 3.0));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].start, 1.0);
        assert_eq!(hits[1].start, 2.0);
    }

    #[test]
    fn test_record_start_only() {
        let rec = parse_tal_record(b"+12.5\x14\x14\x00\x00\x00").unwrap();
        assert_eq!(rec.record_start, 12.5);
        assert!(rec.annotations.is_empty());
    }

    #[test]
    fn test_single_annotation_with_duration() {
        let rec = parse_tal_record(b"+0\x14\x14\x00+0.5\x152.0\x14Spike\x14\x00\x00").unwrap();
        assert_eq!(rec.record_start, 0.0);
        assert_eq!(rec.annotations.len(), 1);
        let a = &rec.annotations[0];
        assert_eq!(a.start, 0.5);
        assert_eq!(a.duration, 2.0);
        assert_eq!(a.label, "Spike");
    }

    #[test]
    fn test_multiple_text_fields_fan_out() {
        let rec = parse_tal_record(b"+1\x14\x14\x00+2\x14Stage W\x14Arousal\x14\x00").unwrap();
        assert_eq!(rec.annotations.len(), 2);
        assert_eq!(rec.annotations[0].label, "Stage W");
        assert_eq!(rec.annotations[1].label, "Arousal");
        assert_eq!(rec.annotations[0].start, 2.0);
        assert_eq!(rec.annotations[1].duration, 0.0);
    }

    #[test]
    fn test_empty_text_fields_discarded() {
        let rec = parse_tal_record(b"+0\x14\x14\x00+3\x14\x14Blink\x14\x00").unwrap();
        assert_eq!(rec.annotations.len(), 1);
        assert_eq!(rec.annotations[0].label, "Blink");
    }

    #[test]
    fn test_unsigned_onset_tolerated() {
        let rec = parse_tal_record(b"+0\x14\x14\x000.5\x14Event\x14\x00\x00").unwrap();
        assert_eq!(rec.annotations[0].start, 0.5);
    }

    #[test]
    fn test_scan_stops_at_double_nul() {
        let rec =
            parse_tal_record(b"+0\x14\x14\x00+1\x14A\x14\x00\x00+2\x14Ghost\x14\x00").unwrap();
        assert_eq!(rec.annotations.len(), 1);
        assert_eq!(rec.annotations[0].label, "A");
    }

    #[test]
    fn test_negative_onset() {
        let rec = parse_tal_record(b"-0.25\x14\x14\x00\x00").unwrap();
        assert_eq!(rec.record_start, -0.25);
    }

    #[test]
    fn test_malformed_onset_fails() {
        let err = parse_tal_record(b"+0\x14\x14\x00abc\x14Event\x14\x00").unwrap_err();
        assert!(matches!(err, ReadError::MalformedAnnotation(_)));
    }

    #[test]
    fn test_utf8_label() {
        let rec = parse_tal_record("+0\x14\x14\x00+1\x14Sömn\x14\x00\x00".as_bytes()).unwrap();
        assert_eq!(rec.annotations[0].label, "Sömn");
    }
}
