//! Per-channel sample caching over a pluggable sink.
//!
//! [`SignalCache`] owns the span bookkeeping (which cache-time ranges
//! hold decoded samples) and delegates storage to a [`SignalSink`].
//! The bundled [`MemorySink`] keeps one flat `f32` buffer per channel;
//! a shared-memory transport can implement the same trait without the
//! engine noticing. Writers publish a channel's updated range only
//! after the samples for it are fully written, so a sink reader never
//! observes a partially written region.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ReadError, Result};
use crate::types::{SignalSpec, TimeRange};

/// Channel geometry handed to [`SignalSink::init`].
#[derive(Debug, Clone, Copy)]
pub struct SinkChannelSpec {
    /// Samples per second; 0.0 for channels that cache nothing.
    pub sampling_rate: f64,
    pub capacity_samples: usize,
}

/// Storage backend for cached samples.
///
/// Ranges are cache time in seconds; implementations convert to sample
/// indices with the per-channel rate given at init. The core never
/// assumes ownership of the backing memory.
pub trait SignalSink: Send + Sync {
    fn init(&self, channels: &[SinkChannelSpec]) -> Result<()>;
    fn write_range(&self, channel: usize, range: TimeRange, samples: &[f32]) -> Result<()>;
    fn read_range(&self, channel: usize, range: TimeRange) -> Result<Vec<f32>>;
    fn set_updated_range(&self, channel: usize, range: TimeRange) -> Result<()>;
    fn updated_range(&self, channel: usize) -> Option<TimeRange>;
}

struct MemoryChannel {
    rate: f64,
    samples: Vec<f32>,
    updated: Option<TimeRange>,
}

/// Process-local sink backed by plain vectors.
#[derive(Default)]
pub struct MemorySink {
    channels: RwLock<Vec<MemoryChannel>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn sample_index(rate: f64, t: f64) -> usize {
        (t * rate).round() as usize
    }
}

impl SignalSink for MemorySink {
    fn init(&self, channels: &[SinkChannelSpec]) -> Result<()> {
        let mut lock = self.channels.write();
        *lock = channels
            .iter()
            .map(|c| MemoryChannel {
                rate: c.sampling_rate,
                samples: vec![0.0; c.capacity_samples],
                updated: None,
            })
            .collect();
        Ok(())
    }

    fn write_range(&self, channel: usize, range: TimeRange, samples: &[f32]) -> Result<()> {
        let mut lock = self.channels.write();
        let ch = lock
            .get_mut(channel)
            .ok_or(ReadError::InvalidChannel(channel))?;
        let start = Self::sample_index(ch.rate, range.start);
        let end = start + samples.len();
        if end > ch.samples.len() {
            return Err(ReadError::OutOfRange {
                start: range.start,
                end: range.end,
                max: ch.samples.len() as f64 / ch.rate.max(f64::MIN_POSITIVE),
            });
        }
        ch.samples[start..end].copy_from_slice(samples);
        Ok(())
    }

    fn read_range(&self, channel: usize, range: TimeRange) -> Result<Vec<f32>> {
        let lock = self.channels.read();
        let ch = lock.get(channel).ok_or(ReadError::InvalidChannel(channel))?;
        let start = Self::sample_index(ch.rate, range.start);
        let end = Self::sample_index(ch.rate, range.end).min(ch.samples.len());
        Ok(ch.samples[start.min(end)..end].to_vec())
    }

    fn set_updated_range(&self, channel: usize, range: TimeRange) -> Result<()> {
        let mut lock = self.channels.write();
        let ch = lock
            .get_mut(channel)
            .ok_or(ReadError::InvalidChannel(channel))?;
        ch.updated = Some(range);
        Ok(())
    }

    fn updated_range(&self, channel: usize) -> Option<TimeRange> {
        self.channels.read().get(channel).and_then(|c| c.updated)
    }
}

/// Cached-span map over a sink.
pub struct SignalCache {
    sink: Arc<dyn SignalSink>,
    rates: Vec<f64>,
    /// Per channel, sorted, non-overlapping cache-time spans.
    spans: Vec<Vec<TimeRange>>,
}

impl SignalCache {
    /// Builds the cache for a recording of `data_length` cache seconds,
    /// initialising `sink` (or a fresh [`MemorySink`]) with full-length
    /// channel buffers.
    pub fn new(
        signals: &[SignalSpec],
        data_length: f64,
        sink: Option<Arc<dyn SignalSink>>,
    ) -> Result<Self> {
        let sink = sink.unwrap_or_else(|| Arc::new(MemorySink::new()));
        let channel_specs: Vec<SinkChannelSpec> = signals
            .iter()
            .map(|s| SinkChannelSpec {
                sampling_rate: s.sampling_rate,
                capacity_samples: if s.is_annotation {
                    0
                } else {
                    (data_length * s.sampling_rate).round() as usize
                },
            })
            .collect();
        sink.init(&channel_specs)?;
        Ok(Self {
            sink,
            rates: signals.iter().map(|s| s.sampling_rate).collect(),
            spans: vec![Vec::new(); signals.len()],
        })
    }

    pub fn channel_count(&self) -> usize {
        self.rates.len()
    }

    /// Writes one decoded chunk. `range` is cache time; `samples` holds
    /// one vector per channel, empty for annotation channels. Each
    /// channel's span set and the sink's published range are updated
    /// only after its samples are stored.
    pub fn insert(&mut self, range: TimeRange, samples: &[Vec<f32>]) -> Result<()> {
        if samples.len() != self.rates.len() {
            return Err(ReadError::InvalidChannel(samples.len()));
        }
        for (ch, data) in samples.iter().enumerate() {
            let rate = self.rates[ch];
            if rate <= 0.0 {
                continue;
            }
            let expected = (range.len() * rate).round() as usize;
            if data.len() != expected {
                return Err(ReadError::ShortRead {
                    expected,
                    got: data.len(),
                });
            }
            self.sink.write_range(ch, range, data)?;
            merge_span(&mut self.spans[ch], range);
            if let Some(primary) = self.spans[ch].first() {
                self.sink.set_updated_range(ch, *primary)?;
            }
        }
        Ok(())
    }

    /// Samples for the cached part of `range`, per channel: the clipped
    /// range and its data, `None` where nothing overlaps (or the
    /// channel caches nothing).
    pub fn as_part(&self, range: TimeRange) -> Result<Vec<Option<(TimeRange, Vec<f32>)>>> {
        let mut out = Vec::with_capacity(self.rates.len());
        for ch in 0..self.rates.len() {
            if self.rates[ch] <= 0.0 {
                out.push(None);
                continue;
            }
            let hit = self.spans[ch]
                .iter()
                .find_map(|span| span.intersect(&range));
            match hit {
                Some(clip) => {
                    let data = self.sink.read_range(ch, clip)?;
                    out.push(Some((clip, data)));
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    /// Intersection of every signal channel's primary covered span:
    /// latest start, earliest end. `None` until all channels hold data.
    pub fn updated_range(&self) -> Option<TimeRange> {
        let mut start = f64::NEG_INFINITY;
        let mut end = f64::INFINITY;
        let mut any = false;
        for (ch, rate) in self.rates.iter().enumerate() {
            if *rate <= 0.0 {
                continue;
            }
            any = true;
            let primary = self.spans[ch].first()?;
            start = start.max(primary.start);
            end = end.min(primary.end);
        }
        if !any || end <= start {
            return None;
        }
        Some(TimeRange { start, end })
    }

    /// Whether `range` is fully covered for every signal channel.
    pub fn is_cached(&self, range: TimeRange) -> bool {
        if range.is_empty() {
            return true;
        }
        self.rates.iter().enumerate().all(|(ch, rate)| {
            *rate <= 0.0 || self.spans[ch].iter().any(|s| s.covers(&range))
        })
    }

    pub fn sink(&self) -> Arc<dyn SignalSink> {
        Arc::clone(&self.sink)
    }
}

/// Folds `range` into a sorted span list, merging overlaps and exact or
/// near abutments.
fn merge_span(spans: &mut Vec<TimeRange>, range: TimeRange) {
    const EPS: f64 = 1e-6;
    let mut merged = range;
    let mut i = 0;
    while i < spans.len() {
        let s = spans[i];
        if s.end + EPS < merged.start {
            i += 1;
            continue;
        }
        if s.start - EPS > merged.end {
            break;
        }
        merged.start = merged.start.min(s.start);
        merged.end = merged.end.max(s.end);
        spans.remove(i);
    }
    let pos = spans
        .iter()
        .position(|s| s.start > merged.start)
        .unwrap_or(spans.len());
    spans.insert(pos, merged);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rate: usize) -> SignalSpec {
        SignalSpec {
            label: "EEG".to_string(),
            transducer: String::new(),
            physical_unit: "uV".to_string(),
            prefiltering: String::new(),
            reserved: String::new(),
            digital_min: -32768,
            digital_max: 32767,
            physical_min: -100.0,
            physical_max: 100.0,
            samples_per_record: rate,
            sampling_rate: rate as f64,
            is_annotation: rate == 0,
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let signals = vec![spec(10)];
        let mut cache = SignalCache::new(&signals, 4.0, None).unwrap();
        cache
            .insert(TimeRange::new(1.0, 2.0), &[vec![7.0; 10]])
            .unwrap();
        let parts = cache.as_part(TimeRange::new(0.5, 1.5)).unwrap();
        let (clip, data) = parts[0].as_ref().unwrap();
        assert_eq!(*clip, TimeRange::new(1.0, 1.5));
        assert_eq!(data, &vec![7.0; 5]);
    }

    #[test]
    fn test_sample_count_mismatch_rejected() {
        let signals = vec![spec(10)];
        let mut cache = SignalCache::new(&signals, 4.0, None).unwrap();
        let err = cache
            .insert(TimeRange::new(0.0, 1.0), &[vec![0.0; 7]])
            .unwrap_err();
        assert!(matches!(
            err,
            ReadError::ShortRead {
                expected: 10,
                got: 7
            }
        ));
    }

    #[test]
    fn test_abutting_spans_merge() {
        let signals = vec![spec(10)];
        let mut cache = SignalCache::new(&signals, 3.0, None).unwrap();
        cache
            .insert(TimeRange::new(0.0, 1.0), &[vec![1.0; 10]])
            .unwrap();
        cache
            .insert(TimeRange::new(2.0, 3.0), &[vec![3.0; 10]])
            .unwrap();
        assert_eq!(cache.updated_range(), Some(TimeRange::new(0.0, 1.0)));
        cache
            .insert(TimeRange::new(1.0, 2.0), &[vec![2.0; 10]])
            .unwrap();
        assert_eq!(cache.updated_range(), Some(TimeRange::new(0.0, 3.0)));
    }

    #[test]
    fn test_updated_range_is_channel_intersection() {
        let signals = vec![spec(10), spec(20)];
        let mut cache = SignalCache::new(&signals, 4.0, None).unwrap();
        cache
            .insert(TimeRange::new(0.0, 2.0), &[vec![0.0; 20], vec![0.0; 40]])
            .unwrap();
        assert_eq!(cache.updated_range(), Some(TimeRange::new(0.0, 2.0)));
    }

    #[test]
    fn test_annotation_channel_is_spanless() {
        let signals = vec![spec(10), spec(0)];
        let mut cache = SignalCache::new(&signals, 2.0, None).unwrap();
        cache
            .insert(TimeRange::new(0.0, 2.0), &[vec![0.0; 20], Vec::new()])
            .unwrap();
        assert_eq!(cache.updated_range(), Some(TimeRange::new(0.0, 2.0)));
        let parts = cache.as_part(TimeRange::new(0.0, 2.0)).unwrap();
        assert!(parts[1].is_none());
    }

    #[test]
    fn test_sink_publishes_after_insert() {
        let signals = vec![spec(10)];
        let mut cache = SignalCache::new(&signals, 2.0, None).unwrap();
        let sink = cache.sink();
        assert!(sink.updated_range(0).is_none());
        cache
            .insert(TimeRange::new(0.0, 1.0), &[vec![5.0; 10]])
            .unwrap();
        assert_eq!(sink.updated_range(0), Some(TimeRange::new(0.0, 1.0)));
    }
}
