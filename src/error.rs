//! Error types for the batching queue core.

use thiserror::Error;

/// Precondition violation constructing or querying a [`crate::Deadline`].
#[derive(Debug, Clone, Error)]
pub enum DeadlineError {
    /// `Deadline::in_` was called with a negative duration.
    #[error("deadline duration must be non-negative, got {millis}ms")]
    NegativeDuration {
        /// The offending duration, in milliseconds.
        millis: i64,
    },
}

/// Precondition violation on a [`crate::BatchingQueue`] lifecycle call.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// `start()` was called twice without an intervening `stop`.
    #[error("queue `{name}` already started")]
    AlreadyStarted {
        /// Name of the queue, for diagnostics.
        name: String,
    },
}
