//! Data-record gap bookkeeping.
//!
//! Discontinuous recordings leave holes between data records. Samples
//! are cached on a contiguous axis ("cache time"), so every gap is
//! keyed by the cache time at which it opens (`data_time`, the end of
//! the contiguous data immediately before the hole), not by its
//! wall-clock position. `recording time = cache time + sum of gap
//! durations with data_time <= cache time`; only this module converts
//! between the two axes.

use crate::error::{ReadError, Result};
use crate::types::{CacheTime, DataGap, RecordingTime, TimeRange};
use crate::utils::approx_eq_ulps;

/// One gap, positioned on the cache axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapEntry {
    /// Cache time at which the gap opens.
    pub data_time: f64,
    /// Seconds of recording time the gap spans.
    pub duration: f64,
}

#[derive(Debug)]
pub struct GapModel {
    /// Sorted by `data_time`, deduplicated.
    entries: Vec<GapEntry>,
    /// Extent of the cache axis: record count times record duration.
    data_length: f64,
    /// Extent of the recording axis, gaps included.
    total_length: f64,
}

impl GapModel {
    pub fn new(data_length: f64, total_length: f64) -> Self {
        Self {
            entries: Vec::new(),
            data_length,
            total_length,
        }
    }

    pub fn entries(&self) -> &[GapEntry] {
        &self.entries
    }

    pub fn total_length(&self) -> f64 {
        self.total_length
    }

    /// Inserts a gap, keeping entries sorted. Re-announcing a gap at an
    /// already-known `data_time` is a no-op: re-decoding a record must
    /// not double a gap.
    pub fn add_gap(&mut self, data_time: f64, duration: f64) {
        if duration <= 0.0 {
            return;
        }
        match self
            .entries
            .binary_search_by(|e| e.data_time.total_cmp(&data_time))
        {
            Ok(_) => {}
            Err(pos) => {
                let duplicate = [pos.wrapping_sub(1), pos]
                    .iter()
                    .filter_map(|&i| self.entries.get(i))
                    .any(|e| approx_eq_ulps(e.data_time, data_time, 16));
                if !duplicate {
                    self.entries.insert(
                        pos,
                        GapEntry {
                            data_time,
                            duration,
                        },
                    );
                }
            }
        }
    }

    /// Gap time inside the recording-time window `[start, end)`. Gaps
    /// straddling an edge contribute only their overlapping part.
    pub fn gap_time_between(&self, start: f64, end: f64) -> f64 {
        let mut preceding = 0.0;
        let mut sum = 0.0;
        for e in &self.entries {
            let rec_start = e.data_time + preceding;
            let rec_end = rec_start + e.duration;
            preceding += e.duration;
            if rec_start >= end {
                break;
            }
            if rec_end <= start {
                continue;
            }
            sum += rec_end.min(end) - rec_start.max(start);
        }
        sum
    }

    /// Total gap time opening strictly before cache time `t`. The gap
    /// at `t` itself belongs to the record starting there and is the
    /// one that record's start timestamp announces.
    pub fn gap_time_before(&self, t: f64) -> f64 {
        self.entries
            .iter()
            .take_while(|e| e.data_time < t)
            .map(|e| e.duration)
            .sum()
    }

    /// Total gap time opening at or before cache time `t`.
    pub fn gap_time_at_or_before(&self, t: f64) -> f64 {
        self.entries
            .iter()
            .take_while(|e| e.data_time <= t)
            .map(|e| e.duration)
            .sum()
    }

    /// Maps recording time onto the contiguous cache axis. A point
    /// inside a gap lands on the gap's cache position.
    pub fn rec_to_cache(&self, t: RecordingTime) -> Result<CacheTime> {
        if t.0 < 0.0 || t.0 > self.total_length {
            return Err(self.out_of_range(t.0, self.total_length));
        }
        Ok(CacheTime(t.0 - self.gap_time_between(0.0, t.0)))
    }

    /// Maps cache time back to recording time. The cache position at
    /// which a gap opens maps to the gap's far edge, where data resumes.
    pub fn cache_to_rec(&self, t: CacheTime) -> Result<RecordingTime> {
        if t.0 < 0.0 || t.0 > self.data_length {
            return Err(self.out_of_range(t.0, self.data_length));
        }
        Ok(RecordingTime(t.0 + self.gap_time_at_or_before(t.0)))
    }

    /// Gaps overlapping a recording-time window, clipped to it.
    pub fn gaps_in(&self, range: &TimeRange) -> Vec<DataGap> {
        let mut preceding = 0.0;
        let mut out = Vec::new();
        for e in &self.entries {
            let rec_start = e.data_time + preceding;
            let rec_end = rec_start + e.duration;
            preceding += e.duration;
            if rec_end <= range.start {
                continue;
            }
            if rec_start >= range.end {
                break;
            }
            let start = rec_start.max(range.start);
            let end = rec_end.min(range.end);
            out.push(DataGap {
                start,
                duration: end - start,
            });
        }
        out
    }

    fn out_of_range(&self, t: f64, max: f64) -> ReadError {
        ReadError::OutOfRange {
            start: t,
            end: t,
            max,
        }
    }
}
