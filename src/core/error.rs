//! Error taxonomy for the share service.
//!
//! Every failure that can cross a worker boundary is classified into one of
//! six kinds. The session worker uses the kind to decide whether to hand the
//! failure to the reconnect supervisor (`Transport`) or surface it to the
//! embedder (everything else).

use thiserror::Error;

/// Coarse error classification exposed to the embedder in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connect refused, broken pipe, read/write timeout. Recoverable.
    Transport,
    /// Malformed frame, unexpected type for state, version mismatch.
    /// Session-fatal, never reconnected.
    Protocol,
    /// Pairing code mismatch or refusal.
    Pairing,
    /// Record corrupt, disk full, permission denied.
    State,
    /// Final content hash mismatch.
    Integrity,
    /// User-initiated cancel. Not a failure; state is preserved.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("pairing: {0}")]
    Pairing(String),

    #[error("state store: {0}")]
    State(String),

    #[error("integrity: {0}")]
    Integrity(String),

    #[error("cancelled")]
    Cancelled,
}

impl ShareError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShareError::Transport(_) => ErrorKind::Transport,
            ShareError::Protocol(_) => ErrorKind::Protocol,
            ShareError::Pairing(_) => ErrorKind::Pairing,
            ShareError::State(_) => ErrorKind::State,
            ShareError::Integrity(_) => ErrorKind::Integrity,
            ShareError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only transport failures are retried; the reconnect supervisor
    /// owns that path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ShareError::Transport(_))
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        ShareError::Transport(err.to_string())
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        ShareError::Protocol(detail.into())
    }
}

impl From<std::io::Error> for ShareError {
    fn from(err: std::io::Error) -> Self {
        ShareError::Transport(err.to_string())
    }
}

pub type ShareResult<T> = Result<T, ShareError>;
