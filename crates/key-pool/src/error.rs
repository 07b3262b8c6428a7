//! Error types for pool and executor operations

use crate::quota::Failure;

/// Errors from pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Every key is exhausted for the day. Recoverable: wait for the reset.
    #[error("no key available: {exhausted} of {total} keys exhausted")]
    NoneAvailable { total: usize, exhausted: usize },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of `RequestExecutor`.
///
/// Callers must branch on the variant: `PoolExhausted` means "try again after
/// the daily reset", `AllAttemptsFailed` means the downstream or the request is
/// unhealthy regardless of quota.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutorError {
    #[error("key pool exhausted: all {total} keys are disabled until the next daily reset")]
    PoolExhausted { total: usize, attempts: u32 },

    #[error("all {attempts} attempts failed, last: {last}")]
    AllAttemptsFailed { attempts: u32, last: Failure },

    #[error("downstream rejected the request ({status}): {message}")]
    RequestRejected { status: u16, message: String },

    #[error("caller deadline exceeded after {attempts} attempts")]
    DeadlineExceeded {
        attempts: u32,
        last: Option<Failure>,
    },
}

impl ExecutorError {
    /// Label for metrics and error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::PoolExhausted { .. } => "pool_exhausted",
            ExecutorError::AllAttemptsFailed { .. } => "all_attempts_failed",
            ExecutorError::RequestRejected { .. } => "request_rejected",
            ExecutorError::DeadlineExceeded { .. } => "deadline_exceeded",
        }
    }
}
