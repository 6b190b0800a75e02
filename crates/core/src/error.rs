//! Error taxonomy surfaced to callers of the connection manager.

use std::fmt;

/// Errors produced while negotiating or running a voice session.
///
/// The first five variants are the reportable taxonomy: each one reaches the
/// caller exactly once through `on_error` together with a transition to
/// `ConnectionState::Error`. `Aborted` and `NotConnected` are returned from
/// API calls only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("Session negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Transport closed unexpectedly: {0}")]
    TransportClosed(String),
    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),
    /// The attempt was cancelled by `disconnect()` or superseded by a newer `connect()`.
    #[error("Connection attempt aborted")]
    Aborted,
    /// The operation needs a live session.
    #[error("Not connected")]
    NotConnected,
}

/// Copyable discriminant of [`VoiceError`], for UI mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    NegotiationFailed,
    ProtocolError,
    TransportClosed,
    UnsupportedEnvironment,
    Aborted,
    NotConnected,
}

impl VoiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            VoiceError::NegotiationFailed(_) => ErrorKind::NegotiationFailed,
            VoiceError::ProtocolError(_) => ErrorKind::ProtocolError,
            VoiceError::TransportClosed(_) => ErrorKind::TransportClosed,
            VoiceError::UnsupportedEnvironment(_) => ErrorKind::UnsupportedEnvironment,
            VoiceError::Aborted => ErrorKind::Aborted,
            VoiceError::NotConnected => ErrorKind::NotConnected,
        }
    }

    /// Whether this error is delivered through `on_error`.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, VoiceError::Aborted | VoiceError::NotConnected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NegotiationFailed => "negotiation_failed",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::TransportClosed => "transport_closed",
            ErrorKind::UnsupportedEnvironment => "unsupported_environment",
            ErrorKind::Aborted => "aborted",
            ErrorKind::NotConnected => "not_connected",
        };
        f.write_str(name)
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(e: serde_json::Error) -> Self {
        VoiceError::ProtocolError(e.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(e: reqwest::Error) -> Self {
        VoiceError::NegotiationFailed(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::TransportClosed(e.to_string())
    }
}

pub type VoiceResult<T> = Result<T, VoiceError>;
