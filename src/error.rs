//! SDK error taxonomy.
//!
//! Every failure surfaced to callers is an [`SdkError`]. Each variant maps to
//! a grepable code and a retryable flag through [`ErrorCode`], which the
//! session manager consults before retrying a call.

use frames::CodecError;

/// Grepable error code and retryable flag.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Errors produced by session, transport, and API operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SdkError {
    /// The streaming endpoint was unreachable or the handshake timed out.
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    /// A streaming call was issued while no streaming channel is up.
    #[error("streaming channel is not connected")]
    NotConnected,

    /// Network-level failure: refused, timed out, or dropped mid-stream.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed or unexpected payload.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The backend answered a streaming request with an error frame.
    #[error("{route} failed ({code}): {message}")]
    Remote { route: String, code: String, message: String },

    /// The HTTP backend returned a non-success status.
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },

    /// The session manager has been closed.
    #[error("session is closed")]
    Closed,

    /// The call was cancelled by the caller.
    #[error("call cancelled")]
    Cancelled,

    /// A configuration value is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SdkError {
    pub(crate) fn connection(endpoint: &str, reason: impl std::fmt::Display) -> Self {
        Self::Connection { endpoint: endpoint.to_owned(), reason: reason.to_string() }
    }

    /// `true` for the connection-establishment family (`ConnectionError`).
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::NotConnected)
    }

    /// `true` for network-level failures (`TransportError`).
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// `true` for malformed payloads (`ProtocolError`).
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

impl ErrorCode for SdkError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "E_CONNECTION",
            Self::NotConnected => "E_NOT_CONNECTED",
            Self::Transport(_) => "E_TRANSPORT",
            Self::Protocol(_) => "E_PROTOCOL",
            Self::Remote { .. } => "E_REMOTE",
            Self::Http { .. } => "E_HTTP_STATUS",
            Self::Closed => "E_CLOSED",
            Self::Cancelled => "E_CANCELLED",
            Self::Config(_) => "E_CONFIG",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http { status: 429 | 500..=599, .. })
    }
}

impl From<CodecError> for SdkError {
    fn from(err: CodecError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::Protocol(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::Http { status: status.as_u16(), body: err.to_string() };
        }
        if err.is_builder() {
            return Self::Config(err.to_string());
        }
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
