//! Request/response message schema for the cache engine.
//!
//! The engine is addressed exclusively through these messages. Inside
//! the crate the reply channel carries `Result<Response, ReadError>`,
//! which the typed facade wrappers surface directly; the raw protocol
//! entry ([`EdfRangeReader::send`](crate::reader::EdfRangeReader::send))
//! folds failures into [`Response::Error`] instead, so every outcome
//! has a serializable wire shape. The serde representation uses
//! kebab-case action tags so the same schema can be spoken over JSON
//! by non-Rust hosts.

use serde::{Deserialize, Serialize};

use crate::error::ReadError;
use crate::types::{Annotation, DataGap, Study, TimeRange};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Request {
    SetupStudy,
    SetupCache,
    CacheSignalsFromUrl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_from: Option<f64>,
    },
    GetSignals {
        range: TimeRange,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_filter: Option<ChannelFilter>,
    },
    GetAnnotations {
        range: TimeRange,
    },
    GetDataGaps {
        range: TimeRange,
    },
    ReleaseCache,
    UpdateSettings {
        settings: Settings,
    },
    Shutdown,
}

/// Channel selection for `get-signals`. An `include` list wins over
/// `exclude`; with neither, every signal channel is returned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<usize>>,
}

impl ChannelFilter {
    pub fn selects(&self, channel: usize) -> bool {
        if let Some(include) = &self.include {
            return include.contains(&channel);
        }
        if let Some(exclude) = &self.exclude {
            return !exclude.contains(&channel);
        }
        true
    }
}

/// Partial settings update; unset fields keep their current values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_chunk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_load_cache_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub await_signals_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum Response {
    Study {
        study: Study,
    },
    CacheReady,
    CacheStarted,
    Signals(SignalData),
    Annotations {
        annotations: Vec<Annotation>,
    },
    DataGaps {
        gaps: Vec<DataGap>,
    },
    Released,
    SettingsUpdated,
    Error {
        error: ErrorInfo,
    },
}

impl Response {
    /// Folds a native error into the wire shape.
    pub fn error(err: &ReadError) -> Self {
        Response::Error {
            error: ErrorInfo {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ReadError {
    /// Stable kind tag carried in error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ReadError::MalformedHeader(_) => "malformed-header",
            ReadError::MalformedAnnotation(_) => "malformed-annotation",
            ReadError::ShortRead { .. } => "short-read",
            ReadError::Io(_) => "io-error",
            ReadError::Http(_) => "http-error",
            ReadError::OutOfRange { .. } => "out-of-range",
            ReadError::NotInitialised(_) => "not-initialised",
            ReadError::AlreadyInitialised => "already-initialised",
            ReadError::CorruptedRecord { .. } => "corrupted-record",
            ReadError::InvalidChannel(_) => "invalid-channel",
            ReadError::CacheBudgetExceeded { .. } => "cache-budget-exceeded",
            ReadError::EngineGone => "engine-gone",
        }
    }
}

/// One returned channel of a `get-signals` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSignal {
    pub channel: usize,
    pub label: String,
    pub sampling_rate: f64,
    pub samples: Vec<f32>,
}

/// Payload of a `get-signals` response: recording-time samples with
/// gap spans zero-filled, plus the annotations and gaps in range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalData {
    pub range: TimeRange,
    pub signals: Vec<ChannelSignal>,
    pub annotations: Vec<Annotation>,
    pub gaps: Vec<DataGap>,
    /// Set when the awaiter deadline expired and the response is
    /// best-effort from cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Progress event emitted after each chunk insert of a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheProgress {
    /// Annotations discovered in the chunk just decoded.
    pub annotations: Vec<Annotation>,
    /// The full gap set known so far.
    pub gaps: Vec<DataGap>,
    /// New contiguous updated range after the insert.
    pub range: TimeRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_action_tags() {
        let req = Request::GetSignals {
            range: TimeRange::new(2.0, 4.0),
            channel_filter: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "get-signals");
        assert_eq!(json["range"]["start"], 2.0);

        let parsed: Request =
            serde_json::from_str(r#"{"action":"cache-signals-from-url","start_from":1.5}"#)
                .unwrap();
        assert!(matches!(
            parsed,
            Request::CacheSignalsFromUrl {
                start_from: Some(s)
            } if s == 1.5
        ));
    }

    #[test]
    fn test_include_wins_over_exclude() {
        let filter = ChannelFilter {
            include: Some(vec![0, 2]),
            exclude: Some(vec![2]),
        };
        assert!(filter.selects(0));
        assert!(!filter.selects(1));
        assert!(filter.selects(2));

        let exclude_only = ChannelFilter {
            include: None,
            exclude: Some(vec![1]),
        };
        assert!(exclude_only.selects(0));
        assert!(!exclude_only.selects(1));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = Response::error(&ReadError::AlreadyInitialised);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["result"], "error");
        assert_eq!(json["error"]["kind"], "already-initialised");
    }
}
