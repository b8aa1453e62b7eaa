use std::fmt;

/// Errors returned by the hint session layer.
#[derive(Debug, thiserror::Error)]
pub enum HintTransportError {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("payload deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// How a failed request should be treated by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendErrorKind {
    /// The peer may accept the same request later; retry after a pause.
    Transient,
    /// Retrying cannot succeed; discard the request.
    Fatal,
}

impl fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendErrorKind::Transient => write!(f, "transient"),
            SendErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure of a single request on the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} send failure: {reason}")]
pub struct SendError {
    pub kind: SendErrorKind,
    pub reason: String,
}

impl SendError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Fatal,
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == SendErrorKind::Transient
    }
}
