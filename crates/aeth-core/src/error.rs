use thiserror::Error;

/// Machine-readable error kind shared by every component in the core.
///
/// Mirrors the taxonomy in the orchestration spec: every error crossing a
/// component boundary carries one of these plus a human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidArg,
    NotFound,
    PreconditionFailed,
    ResourceExhausted,
    PermissionDenied,
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidArg => "invalid-arg",
            Self::NotFound => "not-found",
            Self::PreconditionFailed => "precondition-failed",
            Self::ResourceExhausted => "resource-exhausted",
            Self::PermissionDenied => "permission-denied",
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl ErrorKind {
    /// Whether a task-queue handler that failed with this kind should be retried.
    ///
    /// `precondition-failed` and `invalid-arg` are never retried (§7).
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::PreconditionFailed | Self::InvalidArg)
    }
}

/// A typed domain error carrying an [`ErrorKind`] and a message, with the
/// error chain preserved across task-spawn / goroutine-equivalent boundaries.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    source: Option<anyhow::Error>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_arg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArg, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
