//! Error taxonomy for the per-source frame loop.
//!
//! Most of the crate returns `anyhow::Result`. The two enums here exist because
//! the worker has to decide what to do with a failure, not just report it:
//! retry, skip the frame, or stop.

use thiserror::Error;

/// Failure while acquiring a frame from a source.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Stream unreadable or dropped. The worker reconnects with backoff.
    #[error("source disconnected: {0}")]
    Disconnected(String),

    /// A finite source (image directory, scripted replay) has no more frames.
    #[error("source exhausted")]
    Exhausted,

    /// The source cannot be used at all (bad URL, missing feature).
    #[error("source unusable: {0}")]
    Fatal(String),
}

impl IngestError {
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

/// Failure while running inference on a frame.
#[derive(Debug, Error)]
pub enum DetectError {
    /// This frame could not be processed. Counted as "no detections".
    #[error("inference failed for frame: {0}")]
    Frame(String),

    /// The model or runtime is unusable. The worker stops.
    #[error("detector backend unusable: {0}")]
    Backend(String),
}

impl DetectError {
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
