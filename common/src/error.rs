use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("value at {namespace}/{key} has an unexpected type")]
    TypeMismatch { namespace: String, key: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OtaError {
    #[error("could not open update partition: {0}")]
    Begin(String),
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("image validation failed: {0}")]
    Finalize(String),
    #[error("client disconnected before upload completed")]
    Disconnected,
    #[error("empty firmware image")]
    Empty,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("driver failure: {0}")]
    Driver(String),
}

/// Raised by a request body source when the peer goes away mid-stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("request body source failed: {0}")]
pub struct SourceError(pub String);
