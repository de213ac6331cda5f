// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture engine and its collaborators

use crate::backends::camera::types::BackendError;
use std::fmt;

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Main error type
///
/// Everything except [`CaptureError::Stage`] is raised before or while the
/// session is being (re)started and aborts it. A recycle that arrives after
/// stop, or for a frame the engine no longer tracks, is not an error at all.
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// Mismatched buffer counts, bad stage parameters, invalid options
    Configuration(String),
    /// Buffer allocation or mapping failure
    Resource(String),
    /// Backend start/stop/submit failure, never retried
    Hardware(String),
    /// A post-processing stage failed while processing a frame
    Stage(StageError),
}

/// Failure raised by a post-processing stage
#[derive(Debug, Clone)]
pub struct StageError {
    /// Name of the stage that failed
    pub stage: String,
    /// Human readable reason
    pub message: String,
}

impl StageError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            CaptureError::Resource(msg) => write!(f, "Resource error: {}", msg),
            CaptureError::Hardware(msg) => write!(f, "Hardware error: {}", msg),
            CaptureError::Stage(e) => write!(f, "Stage error: {}", e),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

impl std::error::Error for CaptureError {}
impl std::error::Error for StageError {}

impl From<StageError> for CaptureError {
    fn from(err: StageError) -> Self {
        CaptureError::Stage(err)
    }
}

// Backends only know whether an operation failed; the caller picks the class
// for the ones that are ambiguous (see `CaptureError::hardware`).
impl From<BackendError> for CaptureError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::FormatNotSupported(msg) => CaptureError::Configuration(msg),
            BackendError::OutOfBuffers(msg) => CaptureError::Resource(msg),
            other => CaptureError::Hardware(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Configuration(format!("invalid JSON: {}", err))
    }
}

impl CaptureError {
    /// Wrap a backend failure as a hardware error with context
    pub fn hardware(context: &str, err: BackendError) -> Self {
        CaptureError::Hardware(format!("{}: {}", context, err))
    }

    /// Wrap a backend failure as a resource error with context
    pub fn resource(context: &str, err: BackendError) -> Self {
        CaptureError::Resource(format!("{}: {}", context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_classification() {
        let err: CaptureError = BackendError::OutOfBuffers("no memory".into()).into();
        assert!(matches!(err, CaptureError::Resource(_)));

        let err: CaptureError = BackendError::FormatNotSupported("BGR888".into()).into();
        assert!(matches!(err, CaptureError::Configuration(_)));

        let err: CaptureError = BackendError::NotStarted.into();
        assert!(matches!(err, CaptureError::Hardware(_)));
    }

    #[test]
    fn test_stage_error_display() {
        let err = CaptureError::from(StageError::new("negate", "unsupported format"));
        assert_eq!(err.to_string(), "Stage error: negate: unsupported format");
    }
}
