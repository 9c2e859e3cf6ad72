use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Malformed annotation data: {0}")]
    MalformedAnnotation(String),

    #[error("Short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Range [{start}, {end}] outside recording [0, {max}]")]
    OutOfRange { start: f64, end: f64, max: f64 },

    #[error("Not initialised: {0}")]
    NotInitialised(&'static str),

    #[error("Study already set up")]
    AlreadyInitialised,

    #[error("Record {record} start overlaps prior record by {overlap} s")]
    CorruptedRecord { record: usize, overlap: f64 },

    #[error("Channel index {0} out of range")]
    InvalidChannel(usize),

    #[error("Recording needs {required} cache bytes, budget is {budget}")]
    CacheBudgetExceeded { required: usize, budget: usize },

    #[error("Cache engine is no longer running")]
    EngineGone,
}

pub type Result<T> = std::result::Result<T, ReadError>;
