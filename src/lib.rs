//! # edfrange
//!
//! A progressive reader for EDF, EDF+ and BDF/BDF+ biosignal recordings
//! over random-access byte sources: local files, in-memory buffers, and
//! HTTP servers that answer range requests.
//!
//! The crate is built for interactive viewers of long polygraphic
//! recordings. A background engine owns the recording and fills a
//! per-channel sample cache progressively; callers request time-ranged
//! physical signals, annotations and data-gap metadata and get them as
//! soon as the cache covers the range. Discontinuous (EDF+D) recordings
//! are handled by mapping between recording time (gaps included) and
//! the contiguous cache axis.
//!
//! ```no_run
//! use edfrange::{EdfRangeReader, TimeRange};
//!
//! # async fn demo() -> edfrange::Result<()> {
//! let reader = EdfRangeReader::open_url("https://example.org/night.edf").await?;
//! reader.setup_cache().await?;
//!
//! // Fill the cache in the background while serving requests.
//! let mut progress = reader.cache_signals(None).await?;
//! while let Some(event) = progress.recv().await {
//!     println!("cached up to {:.1} s", event.range.end);
//! }
//!
//! let window = reader.get_signals(TimeRange::new(120.0, 150.0), None).await?;
//! println!("{} annotations in window", window.annotations.len());
//! # Ok(())
//! # }
//! ```

pub mod annotation;
pub mod cache;
pub mod engine;
pub mod error;
pub mod gaps;
pub mod header;
pub mod protocol;
pub mod record;
pub mod reader;
pub mod source;
pub mod types;
pub mod utils;

// Re-export the main surface for convenience
pub use engine::{EngineConfig, LoadDirection};
pub use error::{ReadError, Result};
pub use protocol::{
    CacheProgress, ChannelFilter, ChannelSignal, Request, Response, Settings, SignalData,
};
pub use reader::EdfRangeReader;
pub use source::{ByteSource, FileSource, HttpSource, MemorySource};
pub use types::{
    Annotation, DataFormat, DataGap, Header, SignalSpec, Study, TimeRange,
};

/// Upper bound on the signal count accepted from a header.
pub const MAX_SIGNALS: usize = 4096;

/// Library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
