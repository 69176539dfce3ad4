//! Quorum error abstractions.

use thiserror::Error;

/// Error variants produced while processing operation requests.
///
/// The reconcile entry point is the only place which decides between retry and terminal
/// failure, and it does so purely based on this classification. Everything fatal carries a
/// human-readable message which is surfaced on the operation's terminal status.
#[derive(Debug, Error)]
pub enum OpsError {
    /// An invariant or validation violation which can never be resolved by retrying.
    #[error("{0}")]
    Fatal(String),
    /// A transient error, typically from the cluster API; safe to retry on a later tick.
    #[error(transparent)]
    Retryable(#[from] anyhow::Error),
}

impl OpsError {
    /// Create a new fatal error with the given user-visible message.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Returns `true` if this error must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// A result type whose error classifies retry vs. terminal failure.
pub type OpsResult<T> = std::result::Result<T, OpsError>;
