//! Failures reported back to the connection that asked for something.
//!
//! None of these change session state.  The message text is what the client
//! sees in a `session-error` event.
use std::{error::Error, fmt};

/// Coarse classification used for logging and by callers that only care
/// about the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Capacity,
    Authorization,
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    InvalidName,
    InvalidTempo { bpm: i64, min: u32, max: u32 },
    InvalidMeter { meter: String },
    MalformedEvent,
    SessionNotFound { code: String },
    SessionFull { code: String, capacity: usize },
    NotHost,
    NotInSession,
    Internal { detail: String },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidName
            | SessionError::InvalidTempo { .. }
            | SessionError::InvalidMeter { .. }
            | SessionError::MalformedEvent => ErrorKind::Validation,
            SessionError::SessionNotFound { .. } => ErrorKind::NotFound,
            SessionError::SessionFull { .. } => ErrorKind::Capacity,
            SessionError::NotHost | SessionError::NotInSession => ErrorKind::Authorization,
            SessionError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn internal(detail: impl Into<String>) -> SessionError {
        SessionError::Internal {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::InvalidName => write!(f, "Name is required"),
            SessionError::InvalidTempo { bpm, min, max } => {
                write!(f, "Invalid BPM value {} (allowed {}-{})", bpm, min, max)
            }
            SessionError::InvalidMeter { meter } => {
                write!(f, "Invalid time signature '{}'", meter)
            }
            SessionError::MalformedEvent => write!(f, "Malformed event"),
            SessionError::SessionNotFound { .. } => write!(f, "Session not found"),
            SessionError::SessionFull { .. } => write!(f, "Session is full"),
            SessionError::NotHost => write!(f, "Only the host can perform this action"),
            SessionError::NotInSession => write!(f, "Not in a session"),
            // detail is for the operator log, not the client
            SessionError::Internal { .. } => write!(f, "Internal error"),
        }
    }
}

impl Error for SessionError {}
