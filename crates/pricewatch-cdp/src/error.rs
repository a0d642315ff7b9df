//! Error types for the CDP client.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the browser endpoint, a tab or one of its calls.
#[derive(Debug, Clone, Error)]
pub enum CdpError {
    /// The browser is unreachable or the page no longer exists.
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The websocket failed after it was established.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame addressed to this call could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The browser rejected the command.
    #[error("browser error {code}: {message}")]
    Remote { code: i64, message: String },

    /// The page-context expression threw.
    #[error("evaluation threw: {0}")]
    Exception(String),

    /// The tab was closed before the call completed.
    #[error("tab closed")]
    Closed,

    #[error("'{method}' timed out after {duration:?}")]
    Timeout { method: String, duration: Duration },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(String),

    /// The browser process could not be started.
    #[error("failed to launch browser: {0}")]
    Launch(String),
}

impl CdpError {
    pub fn is_closed(&self) -> bool {
        matches!(self, CdpError::Closed)
    }
}

impl From<reqwest::Error> for CdpError {
    fn from(err: reqwest::Error) -> Self {
        CdpError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for CdpError {
    fn from(err: serde_json::Error) -> Self {
        CdpError::Json(err.to_string())
    }
}

/// Result type alias for CDP operations
pub type Result<T> = std::result::Result<T, CdpError>;
