//! Reader facade over the cache engine.
//!
//! [`EdfRangeReader`] spawns the engine worker, runs the study setup
//! and exposes typed async methods that wrap the request/response
//! protocol. The handle is cheap to clone conceptually but kept single
//! here: dropping it closes the request queue and ends the worker.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::cache::SignalSink;
use crate::engine::{run_engine, CacheEngine, EngineConfig, Envelope};
use crate::error::{ReadError, Result};
use crate::protocol::{
    CacheProgress, ChannelFilter, Request, Response, Settings, SignalData,
};
use crate::source::{ByteSource, FileSource, HttpSource, MemorySource};
use crate::types::{Annotation, DataGap, Header, SignalSpec, Study, TimeRange};

/// Progressive reader for one EDF/BDF recording.
///
/// ```no_run
/// use edfrange::{EdfRangeReader, TimeRange};
///
/// # async fn demo() -> edfrange::Result<()> {
/// let reader = EdfRangeReader::open_file("night.edf").await?;
/// println!(
///     "{:.1} s of data, {} channels",
///     reader.study().data_length,
///     reader.signals().len()
/// );
///
/// reader.setup_cache().await?;
/// let window = reader
///     .get_signals(TimeRange::new(30.0, 60.0), None)
///     .await?;
/// for channel in &window.signals {
///     println!("{}: {} samples", channel.label, channel.samples.len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EdfRangeReader {
    tx: mpsc::Sender<Envelope>,
    study: Study,
    header: Header,
    signals: Vec<SignalSpec>,
}

impl EdfRangeReader {
    /// Opens a recording from a local file.
    pub async fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = FileSource::open(path).await?;
        Self::open_source(Box::new(source), EngineConfig::default()).await
    }

    /// Opens a recording held in memory.
    pub async fn open_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        Self::open_source(
            Box::new(MemorySource::new(bytes)),
            EngineConfig::default(),
        )
        .await
    }

    /// Opens a recording served over HTTP. The server must answer
    /// `Range` requests; the whole setup costs two of them.
    pub async fn open_url(url: impl Into<String>) -> Result<Self> {
        let mut source = HttpSource::new(url);
        source.probe_size().await?;
        Self::open_source(Box::new(source), EngineConfig::default()).await
    }

    /// Opens a recording from any byte source with explicit engine
    /// configuration.
    pub async fn open_source(
        source: Box<dyn ByteSource>,
        config: EngineConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(32);
        let engine = CacheEngine::new(source, config);
        tokio::spawn(run_engine(engine, rx));

        let study = match request(&tx, Request::SetupStudy, None, None).await? {
            Response::Study { study } => study,
            other => return Err(unexpected(other)),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Envelope::Describe { reply: reply_tx })
            .await
            .map_err(|_| ReadError::EngineGone)?;
        let (header, signals) = reply_rx
            .await
            .map_err(|_| ReadError::EngineGone)?
            .ok_or(ReadError::NotInitialised("setup-study has not run"))?;

        Ok(Self {
            tx,
            study,
            header,
            signals,
        })
    }

    /// Study summary: format, data length and total recording length.
    pub fn study(&self) -> Study {
        self.study
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn signals(&self) -> &[SignalSpec] {
        &self.signals
    }

    /// Allocates the per-channel cache buffers for the full recording.
    pub async fn setup_cache(&self) -> Result<()> {
        match request(&self.tx, Request::SetupCache, None, None).await? {
            Response::CacheReady => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Like [`setup_cache`](Self::setup_cache), but backs the cache
    /// with a caller-provided sink (for example a shared-memory
    /// transport to a render thread).
    pub async fn setup_cache_with_sink(&self, sink: Arc<dyn SignalSink>) -> Result<()> {
        match request(&self.tx, Request::SetupCache, Some(sink), None).await? {
            Response::CacheReady => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Returns physical samples for a recording-time range, zero-filled
    /// across data gaps, together with the annotations and gaps in
    /// range. Suspends for at most the configured awaiter deadline when
    /// the range is still being loaded.
    pub async fn get_signals(
        &self,
        range: TimeRange,
        channel_filter: Option<ChannelFilter>,
    ) -> Result<SignalData> {
        let req = Request::GetSignals {
            range,
            channel_filter,
        };
        match request(&self.tx, req, None, None).await? {
            Response::Signals(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    /// Annotations with onset inside `range`, clipped to the recording.
    pub async fn get_annotations(&self, range: TimeRange) -> Result<Vec<Annotation>> {
        match request(&self.tx, Request::GetAnnotations { range }, None, None).await? {
            Response::Annotations { annotations } => Ok(annotations),
            other => Err(unexpected(other)),
        }
    }

    /// Data gaps overlapping `range`, clipped to it.
    pub async fn get_data_gaps(&self, range: TimeRange) -> Result<Vec<DataGap>> {
        match request(&self.tx, Request::GetDataGaps { range }, None, None).await? {
            Response::DataGaps { gaps } => Ok(gaps),
            other => Err(unexpected(other)),
        }
    }

    /// Starts the progressive whole-recording sweep. Progress events
    /// arrive on the returned stream after every chunk; the stream ends
    /// when the sweep completes or is released.
    pub async fn cache_signals(
        &self,
        start_from: Option<f64>,
    ) -> Result<mpsc::UnboundedReceiver<CacheProgress>> {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let req = Request::CacheSignalsFromUrl { start_from };
        match request(&self.tx, req, None, Some(progress_tx)).await? {
            Response::CacheStarted => Ok(progress_rx),
            other => Err(unexpected(other)),
        }
    }

    /// Applies recognised settings keys to the running engine.
    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        match request(&self.tx, Request::UpdateSettings { settings }, None, None).await? {
            Response::SettingsUpdated => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Cancels all load processes and drops the cache buffers. The
    /// reader itself stays usable for header inspection; a new
    /// [`setup_cache`](Self::setup_cache) restores signal access.
    pub async fn release(&self) -> Result<()> {
        match request(&self.tx, Request::ReleaseCache, None, None).await? {
            Response::Released => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Stops the engine worker. Further requests fail with
    /// [`ReadError::EngineGone`].
    pub async fn shutdown(&self) -> Result<()> {
        match request(&self.tx, Request::Shutdown, None, None).await? {
            Response::Released => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Sends a raw protocol request, returning the wire-shaped
    /// response.
    ///
    /// Unlike the typed wrappers above, failures come back as
    /// [`Response::Error`] rather than a native [`ReadError`], so a
    /// host bridging the engine onto another transport (JSON, IPC) can
    /// serialize every outcome, including loss of the engine itself.
    pub async fn send(&self, req: Request) -> Response {
        match request(&self.tx, req, None, None).await {
            Ok(response) => response,
            Err(e) => Response::error(&e),
        }
    }
}

async fn request(
    tx: &mpsc::Sender<Envelope>,
    request: Request,
    sink: Option<Arc<dyn SignalSink>>,
    progress: Option<mpsc::UnboundedSender<CacheProgress>>,
) -> Result<Response> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(Envelope::Request {
        request,
        reply: reply_tx,
        sink,
        progress,
    })
    .await
    .map_err(|_| ReadError::EngineGone)?;
    reply_rx.await.map_err(|_| ReadError::EngineGone)?
}

fn unexpected(response: Response) -> ReadError {
    ReadError::NotInitialised(match response {
        Response::Error { .. } => "engine reported an error",
        _ => "unexpected engine response",
    })
}
