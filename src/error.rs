//! Error types for the playback engine.
//!
//! Public player operations never panic and never return errors directly to
//! the UI; failures are converted into [`Problem`](crate::types::Problem)
//! entries and presence changes. The error type here is the internal
//! currency between sources, caches, and the player state machine.
//!
//! Errors classify themselves via [`PlaybackError::is_retryable`]: a
//! retryable error sends the player through `Reconnecting` with backoff,
//! a non-retryable one is terminal for the player instance.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for playback operations.
pub type Result<T, E = PlaybackError> = std::result::Result<T, E>;

/// Main error type for playback operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PlaybackError {
    #[error("Failed to connect to source: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Source cannot be opened: {reason}")]
    SourceFatal {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to decode message on {topic}: {details}")]
    Decode { topic: String, details: String },

    #[error("No decoder available for schema '{schema_name}'")]
    DecoderUnavailable { schema_name: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Time range of the recording is too long to partition into blocks")]
    RangeTooLong,

    #[error("Invalid operation: {details}")]
    InvalidOperation { details: String },
}

impl PlaybackError {
    /// Whether this error is potentially recoverable through retry.
    ///
    /// Retryable errors drive the `Reconnecting` presence; the rest are
    /// either per-item (dropped and reported) or terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlaybackError::Connection { .. } => true,
            PlaybackError::Timeout { .. } => true,
            PlaybackError::SourceFatal { .. } => false,
            PlaybackError::Decode { .. } => false,
            PlaybackError::DecoderUnavailable { .. } => false,
            PlaybackError::RangeTooLong => false,
            PlaybackError::InvalidOperation { .. } => false,
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection(reason: impl Into<String>) -> Self {
        PlaybackError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with a source.
    pub fn connection_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        PlaybackError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for fatal source errors.
    pub fn source_fatal(reason: impl Into<String>) -> Self {
        PlaybackError::SourceFatal { reason: reason.into(), source: None }
    }

    /// Helper constructor for per-message decode failures.
    pub fn decode(topic: impl Into<String>, details: impl Into<String>) -> Self {
        PlaybackError::Decode { topic: topic.into(), details: details.into() }
    }

    /// Helper constructor for contract violations.
    pub fn invalid_operation(details: impl Into<String>) -> Self {
        PlaybackError::InvalidOperation { details: details.into() }
    }
}
