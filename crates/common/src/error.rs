use std::io;

use thiserror::Error;

/// Canonical error taxonomy used across tundra crates.
///
/// Classification guidance:
/// - [`TundraError::Construction`]: invalid configuration, or a scanner or
///   thread that could not be set up
/// - [`TundraError::Io`]: source read failures
/// - [`TundraError::Evaluation`]: expression evaluation failed for a batch or row
/// - [`TundraError::Cancelled`]: execution was stopped on request; not a failure
/// - [`TundraError::Internal`]: an invariant was violated (hash index corruption, poisoned worker)
/// - [`TundraError::Unsupported`]: valid request for a type/feature combination not implemented
#[derive(Debug, Error)]
pub enum TundraError {
    /// Invalid or inconsistent configuration, or a component that could not be constructed.
    ///
    /// Examples:
    /// - zero scanner threads or zero queue capacity
    /// - overlapping partition ranges
    /// - scanner factory rejected a scan range descriptor
    #[error("construction error: {0}")]
    Construction(String),

    /// Source read failures.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Expression evaluation failures after compilation succeeded.
    ///
    /// Examples:
    /// - filter predicate did not evaluate to a boolean column
    /// - arithmetic kernel overflow
    /// - malformed decimal literal
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// Execution stopped because cancellation was requested.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Fieldless classification of a [`TundraError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`TundraError::Construction`].
    Construction,
    /// See [`TundraError::Io`].
    Io,
    /// See [`TundraError::Evaluation`].
    Evaluation,
    /// See [`TundraError::Cancelled`].
    Cancelled,
    /// See [`TundraError::Internal`].
    Internal,
    /// See [`TundraError::Unsupported`].
    Unsupported,
}

impl TundraError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Construction(_) => ErrorKind::Construction,
            Self::Io(_) => ErrorKind::Io,
            Self::Evaluation(_) => ErrorKind::Evaluation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// True for a requested stop, false for every genuine failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// `io::Error` is not `Clone`; the copy keeps kind and message.
impl Clone for TundraError {
    fn clone(&self) -> Self {
        match self {
            Self::Construction(msg) => Self::Construction(msg.clone()),
            Self::Io(err) => Self::Io(io::Error::new(err.kind(), err.to_string())),
            Self::Evaluation(msg) => Self::Evaluation(msg.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::Internal(msg) => Self::Internal(msg.clone()),
            Self::Unsupported(msg) => Self::Unsupported(msg.clone()),
        }
    }
}

/// Standard tundra result alias.
pub type Result<T> = std::result::Result<T, TundraError>;
