//! Error kinds surfaced by a voice session.

use serde::Serialize;

/// Every failure a session can observe.
///
/// The fatal kinds (`DeviceAccess`, `Signaling`, `Transport`) move the session
/// into the `error` state and are kept as its `last_error`. `Protocol` errors
/// only cause the offending inbound event to be dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The capture device was denied or does not exist.
    #[error("Audio capture device unavailable: {0}")]
    DeviceAccess(String),
    /// The signaling channel could not be opened or negotiation was rejected.
    #[error("Signaling failed: {0}")]
    Signaling(String),
    /// The negotiated transport failed after being established.
    #[error("Transport failed: {0}")]
    Transport(String),
    /// An inbound event could not be decoded.
    #[error("Malformed inbound event: {0}")]
    Protocol(String),
}

/// The category of a [`SessionError`], without its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceAccess,
    Signaling,
    Transport,
    Protocol,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::DeviceAccess(_) => ErrorKind::DeviceAccess,
            SessionError::Signaling(_) => ErrorKind::Signaling,
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Whether this error terminates the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Protocol(_))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}
