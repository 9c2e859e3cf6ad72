//! The cooperative cache engine.
//!
//! One worker task owns the byte source, the sample cache, the gap map
//! and the annotation store. Callers never touch that state: they send
//! [`Request`] messages over an mpsc queue and receive oneshot replies.
//! The engine suspends only at byte reads, at the short pause between
//! sweep chunks, and while awaiters wait for a sweep to cover their
//! range; requests are serviced strictly in arrival order between those
//! points.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::annotation::AnnotationStore;
use crate::cache::{SignalCache, SignalSink};
use crate::error::{ReadError, Result};
use crate::gaps::GapModel;
use crate::header;
use crate::protocol::{
    CacheProgress, ChannelFilter, ChannelSignal, Request, Response, Settings, SignalData,
};
use crate::record;
use crate::source::ByteSource;
use crate::types::{Annotation, Header, RecordingTime, SignalSpec, Study, TimeRange};

/// Pause between sweep chunks so queued requests get serviced.
const CHUNK_PAUSE: Duration = Duration::from_millis(10);

/// Engine tuning knobs, applied at spawn and adjustable over
/// `update-settings`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Target bytes per sweep chunk.
    pub data_chunk_size: usize,
    /// Ceiling on total cached sample bytes after widening to 32-bit.
    pub max_load_cache_size: usize,
    /// Awaiter deadline in milliseconds.
    pub await_signals_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_chunk_size: 8 * 1024 * 1024,
            max_load_cache_size: 1024 * 1024 * 1024,
            await_signals_ms: 5000,
        }
    }
}

impl EngineConfig {
    fn apply(&mut self, settings: &Settings) {
        if let Some(v) = settings.data_chunk_size {
            self.data_chunk_size = v;
        }
        if let Some(v) = settings.max_load_cache_size {
            self.max_load_cache_size = v;
        }
        if let Some(v) = settings.await_signals_ms {
            self.await_signals_ms = v;
        }
    }
}

/// Which way a load process walks its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDirection {
    Forward,
    Backward,
    /// Expand outward from a focus record, alternating sides.
    Alternating { focus: usize },
}

/// An in-flight progressive load over a record range.
///
/// The loaded region is always `[down, up)` within `target`; planning
/// moves one frontier per chunk depending on the direction.
#[derive(Debug)]
pub(crate) struct CacheProcess {
    target: Range<usize>,
    /// Next record to load on the upward side.
    up: usize,
    /// Exclusive end of the next chunk on the downward side.
    down: usize,
    direction: LoadDirection,
    prefer_up: bool,
    pub cancelled: bool,
}

impl CacheProcess {
    pub fn new(target: Range<usize>, direction: LoadDirection) -> Self {
        let (up, down) = match direction {
            LoadDirection::Forward => (target.start, target.start),
            LoadDirection::Backward => (target.end, target.end),
            LoadDirection::Alternating { focus } => {
                let f = focus.clamp(target.start, target.end);
                (f, f)
            }
        };
        Self {
            target,
            up,
            down,
            direction,
            prefer_up: true,
            cancelled: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.up >= self.target.end && self.down <= self.target.start
    }

    /// Plans the next chunk of at most `per_chunk` records; `None` once
    /// the target is exhausted.
    pub fn next_chunk(&mut self, per_chunk: usize) -> Option<Range<usize>> {
        let per_chunk = per_chunk.max(1);
        let up_open = self.up < self.target.end;
        let down_open = self.down > self.target.start;
        let take_up = match self.direction {
            LoadDirection::Forward => true,
            LoadDirection::Backward => false,
            LoadDirection::Alternating { .. } => {
                let side = self.prefer_up;
                self.prefer_up = !self.prefer_up;
                side
            }
        };
        if (take_up && up_open) || !down_open {
            if !up_open {
                return None;
            }
            let chunk = self.up..(self.up + per_chunk).min(self.target.end);
            self.up = chunk.end;
            Some(chunk)
        } else {
            let chunk = self.down.saturating_sub(per_chunk).max(self.target.start)..self.down;
            self.down = chunk.start;
            Some(chunk)
        }
    }

    /// Whether the process will have loaded `records` by the time it
    /// finishes.
    pub fn will_cover(&self, records: &Range<usize>) -> bool {
        records.is_empty()
            || (records.start >= self.target.start && records.end <= self.target.end)
    }
}

/// A `get-signals` caller suspended until a load covers its range.
///
/// The cache-time range it waits for is recomputed on every flush: a
/// running sweep may discover new gaps, which moves the cache-time
/// counterpart of the requested recording-time range.
struct Awaiter {
    /// Requested range, recording time.
    range: TimeRange,
    filter: Option<ChannelFilter>,
    deadline: Instant,
    reply: oneshot::Sender<Result<Response>>,
}

/// Message envelope delivered to the engine task.
pub(crate) enum Envelope {
    Request {
        request: Request,
        reply: oneshot::Sender<Result<Response>>,
        /// Only meaningful for `setup-cache`.
        sink: Option<Arc<dyn SignalSink>>,
        /// Only meaningful for `cache-signals-from-url`.
        progress: Option<mpsc::UnboundedSender<CacheProgress>>,
    },
    /// Internal: hands the parsed header to the facade.
    Describe {
        reply: oneshot::Sender<Option<(Header, Vec<SignalSpec>)>>,
    },
}

struct StudyState {
    header: Header,
    signals: Vec<SignalSpec>,
    gaps: GapModel,
    annotations: AnnotationStore,
    cache: Option<SignalCache>,
    total_length: f64,
}

pub(crate) struct CacheEngine {
    source: Box<dyn ByteSource>,
    config: EngineConfig,
    study: Option<StudyState>,
    process: Option<CacheProcess>,
    progress: Option<mpsc::UnboundedSender<CacheProgress>>,
    awaiters: Vec<Awaiter>,
    next_step_at: Instant,
}

impl CacheEngine {
    pub fn new(source: Box<dyn ByteSource>, config: EngineConfig) -> Self {
        Self {
            source,
            config,
            study: None,
            process: None,
            progress: None,
            awaiters: Vec::new(),
            next_step_at: Instant::now(),
        }
    }

    fn has_active_process(&self) -> bool {
        self.process
            .as_ref()
            .map_or(false, |p| !p.cancelled && !p.is_done())
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.awaiters.iter().map(|a| a.deadline).min()
    }

    fn study(&self) -> Result<&StudyState> {
        self.study
            .as_ref()
            .ok_or(ReadError::NotInitialised("setup-study has not run"))
    }

    fn study_mut(&mut self) -> Result<&mut StudyState> {
        self.study
            .as_mut()
            .ok_or(ReadError::NotInitialised("setup-study has not run"))
    }

    // ------------------------------------------------------------------
    // Request handling
    // ------------------------------------------------------------------

    /// Handles one envelope; returns `true` on shutdown.
    async fn handle(&mut self, envelope: Envelope) -> bool {
        match envelope {
            Envelope::Describe { reply } => {
                let payload = self
                    .study
                    .as_ref()
                    .map(|s| (s.header.clone(), s.signals.clone()));
                let _ = reply.send(payload);
                false
            }
            Envelope::Request {
                request,
                reply,
                sink,
                progress,
            } => match request {
                Request::Shutdown => {
                    self.release();
                    let _ = reply.send(Ok(Response::Released));
                    true
                }
                Request::SetupStudy => {
                    let _ = reply.send(self.setup_study().await);
                    false
                }
                Request::SetupCache => {
                    let _ = reply.send(self.setup_cache(sink));
                    false
                }
                Request::CacheSignalsFromUrl { start_from } => {
                    let _ = reply.send(self.start_sweep(start_from, progress));
                    false
                }
                Request::GetSignals {
                    range,
                    channel_filter,
                } => {
                    self.get_signals(range, channel_filter, reply).await;
                    false
                }
                Request::GetAnnotations { range } => {
                    let _ = reply.send(self.get_annotations(range));
                    false
                }
                Request::GetDataGaps { range } => {
                    let _ = reply.send(self.get_data_gaps(range));
                    false
                }
                Request::ReleaseCache => {
                    self.release();
                    let _ = reply.send(Ok(Response::Released));
                    false
                }
                Request::UpdateSettings { settings } => {
                    self.config.apply(&settings);
                    let _ = reply.send(Ok(Response::SettingsUpdated));
                    false
                }
            },
        }
    }

    async fn setup_study(&mut self) -> Result<Response> {
        if self.study.is_some() {
            return Err(ReadError::AlreadyInitialised);
        }

        let prologue = self.source.read(0, header::HEADER_BLOCK_BYTES).await?;
        let signal_count = header::parse_signal_count(&prologue)?;
        let full_len = header::HEADER_BLOCK_BYTES * (signal_count + 1);
        let full = self.source.read(0, full_len).await?;
        let (hdr, signals) = header::parse(&full)?;

        if let Some(source_len) = self.source.len() {
            let expected = hdr.header_record_bytes as u64
                + (hdr.data_record_count * hdr.record_byte_size) as u64;
            if source_len < expected {
                warn!(
                    "source holds {} bytes, header implies {}",
                    source_len, expected
                );
            }
        }

        let data_length = hdr.data_length();
        let mut total_length = data_length;
        if hdr.discontinuous {
            total_length = total_length.max(self.probe_last_record(&hdr, &signals).await?);
        }

        debug!(
            "study ready: {:?}, {} signals, {} records of {} s, {:.3} s total",
            hdr.format,
            hdr.signal_count,
            hdr.data_record_count,
            hdr.data_record_duration,
            total_length
        );

        let study = Study {
            format: hdr.format,
            data_length,
            recording_length: total_length,
        };
        self.study = Some(StudyState {
            gaps: GapModel::new(data_length, total_length),
            annotations: AnnotationStore::new(),
            cache: None,
            total_length,
            header: hdr,
            signals,
        });
        Ok(Response::Study { study })
    }

    /// Reads the last data record of a discontinuous recording to learn
    /// when it starts. Annotations and gaps seen here are discarded;
    /// the sweep re-collects them.
    async fn probe_last_record(&mut self, hdr: &Header, signals: &[SignalSpec]) -> Result<f64> {
        let last = hdr.data_record_count - 1;
        let bytes = self
            .source
            .read(hdr.record_offset(last), hdr.record_byte_size)
            .await?;
        let decoded = record::decode(hdr, signals, &bytes, last, 1, 0.0)?;
        match decoded.record_starts[0] {
            Some(start) => Ok(start + hdr.data_record_duration),
            None => {
                warn!("discontinuous recording has no annotation channel; assuming contiguous");
                Ok(hdr.data_length())
            }
        }
    }

    fn setup_cache(&mut self, sink: Option<Arc<dyn SignalSink>>) -> Result<Response> {
        let state = self.study_mut()?;
        let data_length = state.header.data_length();
        state.cache = Some(SignalCache::new(&state.signals, data_length, sink)?);
        Ok(Response::CacheReady)
    }

    fn release(&mut self) {
        if let Some(p) = self.process.as_mut() {
            p.cancelled = true;
        }
        self.process = None;
        self.progress = None;
        self.awaiters.clear();
        if let Some(state) = self.study.as_mut() {
            state.cache = None;
        }
    }

    fn get_annotations(&self, range: TimeRange) -> Result<Response> {
        let state = self.study()?;
        let clipped = range.clamp_to(&TimeRange::new(0.0, state.total_length));
        Ok(Response::Annotations {
            annotations: state.annotations.query(&clipped),
        })
    }

    fn get_data_gaps(&self, range: TimeRange) -> Result<Response> {
        let state = self.study()?;
        let clipped = range.clamp_to(&TimeRange::new(0.0, state.total_length));
        Ok(Response::DataGaps {
            gaps: state.gaps.gaps_in(&clipped),
        })
    }

    // ------------------------------------------------------------------
    // get-signals
    // ------------------------------------------------------------------

    async fn get_signals(
        &mut self,
        range: TimeRange,
        filter: Option<ChannelFilter>,
        reply: oneshot::Sender<Result<Response>>,
    ) {
        match self.try_get_signals(&range, &filter).await {
            Ok(Some(data)) => {
                let _ = reply.send(Ok(Response::Signals(data)));
            }
            Ok(None) => {
                // A running load will cover the range; suspend the caller.
                self.awaiters.push(Awaiter {
                    range,
                    filter,
                    deadline: Instant::now()
                        + Duration::from_millis(self.config.await_signals_ms),
                    reply,
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// `Ok(Some)` when served immediately, `Ok(None)` when the caller
    /// should wait for the active process.
    async fn try_get_signals(
        &mut self,
        range: &TimeRange,
        filter: &Option<ChannelFilter>,
    ) -> Result<Option<SignalData>> {
        {
            let state = self.study()?;
            if state.cache.is_none() {
                return Err(ReadError::NotInitialised("setup-cache has not run"));
            }
        }
        self.check_bounds(range)?;

        let needed = self.needed_cache_range(range)?;
        let cached = self
            .study()?
            .cache
            .as_ref()
            .map_or(false, |c| c.is_cached(needed));
        if cached {
            return self.assemble(range, filter).map(Some);
        }

        let needed_records = self.records_for(&needed);
        if self.has_active_process()
            && self
                .process
                .as_ref()
                .map_or(false, |p| p.will_cover(&needed_records))
        {
            return Ok(None);
        }

        // Inline sub-load of the minimal aligned record span.
        self.load_records(needed_records).await?;
        self.assemble(range, filter).map(Some)
    }

    fn check_bounds(&self, range: &TimeRange) -> Result<()> {
        let total = self.study()?.total_length;
        if range.start < 0.0 || range.end > total || range.end < range.start {
            return Err(ReadError::OutOfRange {
                start: range.start,
                end: range.end,
                max: total,
            });
        }
        Ok(())
    }

    /// Cache-time counterpart of a recording-time range.
    fn needed_cache_range(&self, range: &TimeRange) -> Result<TimeRange> {
        let state = self.study()?;
        let start = state.gaps.rec_to_cache(RecordingTime(range.start))?;
        let end = state.gaps.rec_to_cache(RecordingTime(range.end))?;
        Ok(TimeRange::new(start.0, end.0))
    }

    /// Record span covering a cache-time range, clamped to the recording.
    fn records_for(&self, needed: &TimeRange) -> Range<usize> {
        let state = match self.study() {
            Ok(s) => s,
            Err(_) => return 0..0,
        };
        let dur = state.header.data_record_duration;
        let count = state.header.data_record_count;
        let first = ((needed.start / dur).floor().max(0.0) as usize).min(count);
        let last = ((needed.end / dur).ceil() as usize).clamp(first, count);
        first..last
    }

    /// Reads, decodes and caches a contiguous record span; returns the
    /// annotations found in it.
    async fn load_records(&mut self, records: Range<usize>) -> Result<Vec<Annotation>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let (offset, len, prior_gap) = {
            let state = self.study()?;
            let hdr = &state.header;
            (
                hdr.record_offset(records.start),
                records.len() * hdr.record_byte_size,
                state
                    .gaps
                    .gap_time_before(records.start as f64 * hdr.data_record_duration),
            )
        };

        let bytes = self.source.read(offset, len).await?;

        let state = self.study_mut()?;
        let decoded = record::decode(
            &state.header,
            &state.signals,
            &bytes,
            records.start,
            records.len(),
            prior_gap,
        )?;

        for gap in &decoded.gaps {
            state.gaps.add_gap(gap.data_time, gap.duration);
        }
        state
            .annotations
            .extend(decoded.annotations.iter().cloned());

        let dur = state.header.data_record_duration;
        let range = TimeRange::new(
            records.start as f64 * dur,
            records.end as f64 * dur,
        );
        state
            .cache
            .as_mut()
            .ok_or(ReadError::NotInitialised("setup-cache has not run"))?
            .insert(range, &decoded.samples)?;

        Ok(decoded.annotations)
    }

    // ------------------------------------------------------------------
    // Assembly
    // ------------------------------------------------------------------

    fn assemble(&self, range: &TimeRange, filter: &Option<ChannelFilter>) -> Result<SignalData> {
        self.assemble_with_warning(range, filter, None)
    }

    /// Builds recording-time sample buffers for a range: contiguous
    /// cache data placed first, then every overlapping gap shifted open
    /// and zero-filled, clipping at the buffer end.
    fn assemble_with_warning(
        &self,
        range: &TimeRange,
        filter: &Option<ChannelFilter>,
        warning: Option<String>,
    ) -> Result<SignalData> {
        let state = self.study()?;
        let cache = state
            .cache
            .as_ref()
            .ok_or(ReadError::NotInitialised("setup-cache has not run"))?;

        let prior = state.gaps.gap_time_between(0.0, range.start);
        let inner = state.gaps.gap_time_between(range.start, range.end);
        let read = TimeRange::new(range.start - prior, range.end - prior - inner);
        let parts = cache.as_part(read)?;
        let gaps = state.gaps.gaps_in(range);

        let mut signals = Vec::new();
        for (ch, spec) in state.signals.iter().enumerate() {
            if spec.is_annotation {
                continue;
            }
            if let Some(f) = filter {
                if !f.selects(ch) {
                    continue;
                }
            }
            let sr = spec.sampling_rate;
            let n = (range.len() * sr).round() as usize;
            let mut buf = vec![0.0f32; n];

            if let Some((clip, data)) = &parts[ch] {
                let offset = ((clip.start - read.start) * sr).round() as usize;
                if offset < n {
                    let take = data.len().min(n - offset);
                    buf[offset..offset + take].copy_from_slice(&data[..take]);
                }
            }

            for gap in &gaps {
                let gap_idx = ((gap.start - range.start) * sr).round() as usize;
                let shift = (gap.duration * sr).round() as usize;
                shift_tail(&mut buf, gap_idx, shift);
            }

            signals.push(ChannelSignal {
                channel: ch,
                label: spec.label.clone(),
                sampling_rate: sr,
                samples: buf,
            });
        }

        Ok(SignalData {
            range: *range,
            signals,
            annotations: state.annotations.query(range),
            gaps,
            warning,
        })
    }

    // ------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------

    fn start_sweep(
        &mut self,
        start_from: Option<f64>,
        progress: Option<mpsc::UnboundedSender<CacheProgress>>,
    ) -> Result<Response> {
        let (first, record_count) = {
            let state = self.study()?;
            if state.cache.is_none() {
                return Err(ReadError::NotInitialised("setup-cache has not run"));
            }
            let hdr = &state.header;

            let required = (hdr.record_byte_size * hdr.data_record_count) as f64
                * hdr.format.widen_factor();
            if required > self.config.max_load_cache_size as f64 {
                return Err(ReadError::CacheBudgetExceeded {
                    required: required as usize,
                    budget: self.config.max_load_cache_size,
                });
            }

            let first = match start_from {
                Some(t) => {
                    let cache_t = state.gaps.rec_to_cache(RecordingTime(t))?;
                    ((cache_t.0 / hdr.data_record_duration).floor() as usize)
                        .min(hdr.data_record_count)
                }
                None => 0,
            };
            (first, hdr.data_record_count)
        };

        if let Some(p) = self.process.as_mut() {
            debug!("replacing active load process");
            p.cancelled = true;
        }
        self.process = Some(CacheProcess::new(
            first..record_count,
            LoadDirection::Forward,
        ));
        self.progress = progress;
        self.next_step_at = Instant::now();
        Ok(Response::CacheStarted)
    }

    fn records_per_chunk(&self) -> usize {
        let record_byte_size = self
            .study
            .as_ref()
            .map(|s| s.header.record_byte_size)
            .unwrap_or(1)
            .max(1);
        (self.config.data_chunk_size / record_byte_size).max(1)
    }

    /// Loads the next chunk of the active process, publishes progress
    /// and wakes satisfied awaiters.
    async fn step_process(&mut self) {
        let per_chunk = self.records_per_chunk();
        let chunk = match self.process.as_mut() {
            Some(p) if !p.cancelled => p.next_chunk(per_chunk),
            _ => None,
        };
        let Some(chunk) = chunk else {
            self.finish_process();
            return;
        };

        match self.load_records(chunk.clone()).await {
            Ok(chunk_annotations) => {
                self.publish_progress(chunk_annotations);
                self.flush_awaiters();
            }
            Err(ReadError::MalformedAnnotation(msg)) => {
                // One bad record batch does not end the sweep.
                warn!("chunk {:?} failed: {}", chunk, msg);
            }
            Err(e) => {
                warn!("sweep aborted: {}", e);
                self.process = None;
                self.progress = None;
            }
        }

        if self.process.as_ref().map_or(false, |p| p.is_done()) {
            self.finish_process();
        }
        self.next_step_at = Instant::now() + CHUNK_PAUSE;
    }

    fn finish_process(&mut self) {
        if self.process.take().is_some() {
            debug!("load process finished");
        }
        // Dropping the sender ends the facade's progress stream.
        self.progress = None;
        self.flush_awaiters();
    }

    fn publish_progress(&mut self, chunk_annotations: Vec<Annotation>) {
        let event = {
            let Some(state) = self.study.as_ref() else {
                return;
            };
            let Some(cache) = state.cache.as_ref() else {
                return;
            };
            let Some(range) = cache.updated_range() else {
                return;
            };
            CacheProgress {
                annotations: chunk_annotations,
                gaps: state
                    .gaps
                    .gaps_in(&TimeRange::new(0.0, state.total_length)),
                range,
            }
        };
        let dropped = match self.progress.as_ref() {
            Some(tx) => tx.send(event).is_err(),
            None => false,
        };
        if dropped {
            // Receiver gone; keep sweeping, progress is best-effort.
            self.progress = None;
        }
    }

    // ------------------------------------------------------------------
    // Awaiters
    // ------------------------------------------------------------------

    /// Replies to awaiters whose range is now cached.
    fn flush_awaiters(&mut self) {
        if self.awaiters.is_empty() {
            return;
        }
        let awaiters = std::mem::take(&mut self.awaiters);
        for a in awaiters {
            let ready = self
                .needed_cache_range(&a.range)
                .ok()
                .and_then(|needed| {
                    let cache = self.study.as_ref()?.cache.as_ref()?;
                    Some(cache.is_cached(needed))
                })
                .unwrap_or(false);
            if ready {
                let result = self.assemble(&a.range, &a.filter).map(Response::Signals);
                let _ = a.reply.send(result);
            } else {
                self.awaiters.push(a);
            }
        }
    }

    /// Serves awaiters whose deadline has passed, best-effort from
    /// whatever is cached.
    fn expire_awaiters(&mut self) {
        let now = Instant::now();
        let awaiters = std::mem::take(&mut self.awaiters);
        for a in awaiters {
            if a.deadline > now {
                self.awaiters.push(a);
                continue;
            }
            let warning = format!(
                "requested range not cached within {} ms; returning what is available",
                self.config.await_signals_ms
            );
            let result = self
                .assemble_with_warning(&a.range, &a.filter, Some(warning))
                .map(Response::Signals);
            let _ = a.reply.send(result);
        }
    }
}

/// Opens a hole of `shift` samples at `at`, pushing the tail right and
/// zero-filling the hole; anything pushed past the end is clipped.
fn shift_tail(buf: &mut [f32], at: usize, shift: usize) {
    let n = buf.len();
    if at >= n || shift == 0 {
        return;
    }
    let hole_end = (at + shift).min(n);
    if hole_end < n {
        buf.copy_within(at..n - shift, hole_end);
    }
    buf[at..hole_end].fill(0.0);
}

/// Engine worker loop. Exits when every request handle is dropped or a
/// `shutdown` request arrives.
pub(crate) async fn run_engine(mut engine: CacheEngine, mut rx: mpsc::Receiver<Envelope>) {
    loop {
        let deadline = engine.earliest_deadline();
        let stepping = engine.has_active_process();
        let step_at = engine.next_step_at;
        tokio::select! {
            biased;
            msg = rx.recv() => {
                match msg {
                    None => break,
                    Some(envelope) => {
                        if engine.handle(envelope).await {
                            break;
                        }
                    }
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                engine.expire_awaiters();
            }
            _ = sleep_until(step_at), if stepping => {
                engine.step_process().await;
            }
        }
    }
}
