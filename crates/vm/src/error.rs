//! Error types for the runtime.
//!
//! Two layers exist:
//! - [`Failure`] is the cheap sentinel returned by allocation helpers and
//!   natives. It never unwinds; the caller decides whether to collect and
//!   retry or to surface a language-level error.
//! - [`RuntimeError`] is what escapes an operation once the local retry
//!   policy has been exhausted.

use std::path::PathBuf;

use crate::program::ProcessId;

/// Sentinel failure produced by allocation and native helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    /// The heap asked for a collection before the allocation can succeed.
    #[error("Retry after GC.")]
    RetryAfterGc,

    #[error("Wrong argument type.")]
    WrongArgumentType,

    #[error("Index out of bounds.")]
    IndexOutOfBounds,

    #[error("Illegal state.")]
    IllegalState,
}

impl Failure {
    pub fn is_retry_after_gc(self) -> bool {
        self == Failure::RetryAfterGc
    }
}

/// Errors surfaced by runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Allocation still failed after a forced collection.
    #[error("allocation of {what} failed after garbage collection")]
    AllocationFailed { what: &'static str },

    /// The stack could not grow past the configured ceiling.
    #[error("stack overflow: {requested} slots requested, maximum is {maximum}")]
    StackOverflow { requested: usize, maximum: usize },

    /// A runtime invariant was broken. Indicates a bug in the runtime.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A native dispatch reached code that must not be reachable.
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("process {0} not found")]
    ProcessNotFound(ProcessId),

    #[error("native failed: {0}")]
    Native(#[from] Failure),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    pub fn invariant(message: impl Into<String>) -> Self {
        RuntimeError::InvariantViolation(message.into())
    }

    /// Whether the error must take the whole process down rather than be
    /// surfaced as a catchable language-level error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::InvariantViolation(_) | RuntimeError::Unreachable(_)
        )
    }
}
