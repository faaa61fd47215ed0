//! Error types for upstream calls

use std::time::Duration;

/// Terminal error of one upstream call. At most one is surfaced per call.
///
/// Malformed upstream lines are not represented here: they are skipped
/// locally (see [`crate::DecodeSkip`]) and never reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request body or headers could not be built. No upstream contact.
    #[error("failed to build upstream request: {0}")]
    RequestConstruction(String),

    /// Connecting to or sending to the upstream failed.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The exchange exceeded its wall-clock ceiling.
    #[error("upstream exchange exceeded {}s", .0.as_secs())]
    Timeout(Duration),

    /// The upstream answered with a non-success status.
    #[error("upstream returned status {status}")]
    Status { status: u16 },

    /// Reading the response body failed after streaming started.
    #[error("upstream body read failed: {0}")]
    Stream(String),

    /// The caller's cancellation fired or the consumer went away.
    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::RequestConstruction(_) => "request",
            Error::Transport(_) => "transport",
            Error::Timeout(_) => "timeout",
            Error::Status { .. } => "status",
            Error::Stream(_) => "stream",
            Error::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Upstream status code, for [`Error::Status`] only.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status } => Some(*status),
            _ => None,
        }
    }
}

/// Result alias for upstream calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a buffered call, keeping whatever text arrived before it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PartialFailure {
    /// Concatenation of all tokens delivered before the failure.
    pub partial: String,
    #[source]
    pub error: Error,
}
