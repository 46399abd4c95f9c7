//! Error taxonomy for artifact resolution, model loading, and prediction.
//!
//! Load-time failures (`ResolveError`, `LoadError`) are cached per model
//! version by the loader; request-time failures (`ValidationError`,
//! `PredictError`) never are.

use thiserror::Error;

/// Startup-fatal: the process must not serve prediction traffic without a
/// usable credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file not found: {0}")]
    Missing(String),
    #[error("credential file unreadable: {0}")]
    Unreadable(#[source] std::io::Error),
    #[error("credential file is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("credential file missing required field `{0}`")]
    IncompleteKey(&'static str),
}

/// Remote artifact fetch failure. Only `Transient` is retried.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("remote storage rejected credentials (status {status})")]
    AuthFailure { status: u16 },
    #[error("artifact not found at `{path}`")]
    NotFound { path: String },
    #[error("transient fetch failure: {reason}")]
    Transient { reason: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("artifact integrity check failed: expected sha256 {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("artifact cache i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("artifact deserialization failed: {0}")]
    Deserialize(String),
    #[error("model load interrupted by shutdown")]
    Shutdown,
}

/// Client-caused request rejection; never retried server-side.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("missing feature `{0}`")]
    MissingFeature(String),
    #[error("unknown feature `{0}`")]
    UnknownFeature(String),
    #[error("feature `{0}` must be a finite number")]
    NotANumber(String),
}

/// Predictor-internal failure during an otherwise valid request.
#[derive(Debug, Error)]
#[error("prediction failed: {0}")]
pub struct PredictError(pub String);
