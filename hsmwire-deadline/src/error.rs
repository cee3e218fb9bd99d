//! Deadline error types.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeadlineError {
    #[error("deadline exceeded after {waited:?}")]
    Timeout { waited: Duration },
}

impl DeadlineError {
    /// Builds the default timeout error; usable as a `make_timeout` callback.
    pub fn timeout(waited: Duration) -> Self {
        DeadlineError::Timeout { waited }
    }

    /// A timed-out request may be retried.
    pub fn is_retryable(&self) -> bool {
        true
    }
}
