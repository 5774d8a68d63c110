//! Error handling for the capture pipeline crate
//!
//! Pipeline operations return [`PipelineError`](crate::pipeline::PipelineError).
//! Host-facing code (configuration, descriptor loading, the demo binary)
//! works with [`CaptureError`], which wraps pipeline errors and adds context.

use crate::pipeline::error::PipelineError;
use thiserror::Error;

/// Main error type for host-facing operations
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Errors raised by a pipeline
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CaptureError>,
    },
}

impl CaptureError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CaptureError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The pipeline error at the bottom of a context chain, if any.
    pub fn pipeline_error(&self) -> Option<&PipelineError> {
        match self {
            CaptureError::Pipeline(err) => Some(err),
            CaptureError::WithContext { source, .. } => source.pipeline_error(),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for CaptureError {
    fn from(err: toml::de::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for CaptureError {
    fn from(err: toml::ser::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}

/// Result type alias for host-facing operations
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| CaptureError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| CaptureError::from(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::Config("queue depth is zero".to_string());
        assert_eq!(err.to_string(), "Configuration error: queue depth is zero");
    }

    #[test]
    fn test_error_with_context() {
        let err = CaptureError::Config("test".to_string());
        let with_ctx = err.with_context("Failed to load");
        assert!(with_ctx.to_string().contains("Failed to load"));
    }

    #[test]
    fn test_pipeline_error_context() {
        let result: std::result::Result<(), PipelineError> = Err(PipelineError::Cancelled);
        let err = result.context("submitting request 3").unwrap_err();
        assert!(err.to_string().starts_with("submitting request 3"));
        assert!(matches!(err.pipeline_error(), Some(PipelineError::Cancelled)));
    }
}
