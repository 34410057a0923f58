//! The typed error surface callers can match on.
//!
//! Internal plumbing keeps using `color_eyre::Result` the way the rest
//! of the ambient stack does; this enum is only constructed at the
//! boundary of the public API (see the `From<color_eyre::eyre::Error>`
//! impl and its `Other` catch-all variant).

use thiserror::Error;

/// Errors surfaced to callers of the public API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskGraphError {
    /// A task's input was not a well-formed input value: not a
    /// string-keyed map, or containing a node with no serializable or
    /// artifact/task identity, or transitively containing itself.
    #[error("invalid task input: {0}")]
    InvalidInput(String),

    /// A task's output was not a well-formed output value.
    #[error("invalid task output: {0}")]
    InvalidOutput(String),

    /// An artifact's destination resolves outside its work directory.
    #[error("artifact destination escapes its base directory: {0}")]
    ArtifactEscape(String),

    /// A cache lookup found no entry for the requested fingerprint.
    #[error("no cache entry for fingerprint {0}")]
    CacheNotFound(String),

    /// An operation that must not clobber an existing path found one.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A task body requested a retry more times than the runtime allows.
    #[error("task exhausted its retry budget ({attempts} attempts)")]
    RetriesExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Anything else: filesystem I/O, (de)serialization, lock
    /// acquisition, and other plumbing failures that don't have a
    /// named taxonomy entry above.
    #[error(transparent)]
    Other(#[from] color_eyre::eyre::Error),
}

/// Convenience alias for the public API's return type.
pub type Result<T> = std::result::Result<T, TaskGraphError>;

/// Internal signal a task body raises to request a fresh attempt.
///
/// This is caught inside the task runtime (see [`crate::task`]) and
/// never reaches a caller directly — a body that keeps raising it past
/// the retry budget surfaces as [`TaskGraphError::RetriesExhausted`].
#[derive(Debug, Error)]
#[error("task requested a retry")]
pub struct RetryTask;
