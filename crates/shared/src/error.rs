use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by every request/response boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure or an unparseable body.
    Transport,
    /// The server answered with an explicit failure envelope.
    ApplicationFailure,
    /// The body parsed but lacked a field the client relies on.
    ValidationGap,
}

impl ErrorKind {
    /// The kind the user is shown. A validation gap has no handling of its
    /// own and is surfaced exactly like a transport failure.
    pub fn user_facing(self) -> Self {
        match self {
            ErrorKind::ValidationGap => ErrorKind::Transport,
            other => other,
        }
    }
}

/// Why a response envelope could not be acted on.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct EnvelopeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EnvelopeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation_gap(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationGap, message)
    }
}
