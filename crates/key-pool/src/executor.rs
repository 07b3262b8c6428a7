//! Logical downstream calls with failover across the key pool
//!
//! One `execute` call makes up to `max_attempts` attempts. Each attempt takes
//! a key from the pool, calls the downstream without holding the pool lock,
//! classifies the result and records it against that key. Attempts and keys
//! tried are counted separately: the pool is asked to avoid keys already tried
//! in this call, but an attempt is spent either way.

use std::sync::Arc;

use downstream::{Downstream, DownstreamRequest};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, ExecutorError};
use crate::pool::KeyPool;
use crate::quota::{FatalScope, Failure, Outcome, classify_response, classify_transport};

/// Default attempts per logical call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Per-call knobs for `RequestExecutor::execute_with`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Quota units charged to the key on success.
    pub estimated_units: u64,
    /// Overrides the executor's default attempt budget.
    pub max_attempts: Option<u32>,
    /// No new attempt starts after this instant.
    pub deadline: Option<Instant>,
}

impl ExecuteOptions {
    pub fn new(estimated_units: u64) -> Self {
        Self {
            estimated_units,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Normalized successful result.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub payload: serde_json::Value,
    /// Redacted identifier of the key that served the call.
    pub key: String,
    pub attempts: u32,
    pub units: u64,
}

/// Executes logical calls against a downstream using keys from a shared pool.
pub struct RequestExecutor {
    pool: Arc<KeyPool>,
    downstream: Arc<dyn Downstream>,
    max_attempts: u32,
}

impl RequestExecutor {
    pub fn new(pool: Arc<KeyPool>, downstream: Arc<dyn Downstream>) -> Self {
        Self::with_max_attempts(pool, downstream, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(
        pool: Arc<KeyPool>,
        downstream: Arc<dyn Downstream>,
        max_attempts: u32,
    ) -> Self {
        Self {
            pool,
            downstream,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Execute with the default attempt budget and no deadline.
    pub async fn execute(
        &self,
        request: &DownstreamRequest,
        estimated_units: u64,
    ) -> Result<Response, ExecutorError> {
        self.execute_with(request, ExecuteOptions::new(estimated_units))
            .await
    }

    #[instrument(skip_all, fields(endpoint = %request.endpoint, downstream = self.downstream.id()))]
    pub async fn execute_with(
        &self,
        request: &DownstreamRequest,
        options: ExecuteOptions,
    ) -> Result<Response, ExecutorError> {
        let result = self.run(request, &options).await;
        let label = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::counter!("key_pool_executions_total", "result" => label).increment(1);
        result
    }

    async fn run(
        &self,
        request: &DownstreamRequest,
        options: &ExecuteOptions,
    ) -> Result<Response, ExecutorError> {
        let max_attempts = options.max_attempts.unwrap_or(self.max_attempts).max(1);
        let units = options.estimated_units;
        let mut tried: Vec<usize> = Vec::new();
        let mut last: Option<Failure> = None;
        let mut attempts = 0u32;

        while attempts < max_attempts {
            if let Some(deadline) = options.deadline
                && Instant::now() >= deadline
            {
                warn!(attempts, "caller deadline reached, not starting another attempt");
                return Err(ExecutorError::DeadlineExceeded { attempts, last });
            }

            let selected = match self.pool.next_excluding(&tried).await {
                Ok(selected) => selected,
                Err(Error::NoneAvailable { total, exhausted }) => {
                    warn!(total, exhausted, attempts, "key pool exhausted");
                    return Err(ExecutorError::PoolExhausted { total, attempts });
                }
            };
            attempts += 1;
            if !tried.contains(&selected.position) {
                tried.push(selected.position);
            }
            let credential = selected.credential.expose();

            debug!(attempt = attempts, key = %selected.label, "calling downstream");
            let outcome = match self.downstream.call(request, credential).await {
                Ok(raw) => classify_response(raw.status, &raw.body),
                Err(e) => Outcome::Failed(classify_transport(&e)),
            };

            let failure = match outcome {
                Outcome::Success(payload) => {
                    self.pool.record_success(credential, units).await;
                    metrics::counter!("key_pool_attempts_total", "outcome" => "success")
                        .increment(1);
                    if attempts > 1 {
                        info!(attempts, key = %selected.label, "request succeeded after failover");
                    }
                    return Ok(Response {
                        payload,
                        key: selected.label,
                        attempts,
                        units,
                    });
                }
                Outcome::Failed(failure) => failure,
            };
            metrics::counter!("key_pool_attempts_total", "outcome" => failure.label()).increment(1);

            match &failure {
                Failure::QuotaExceeded(_) => {
                    self.pool.record_quota_exceeded(credential).await;
                }
                Failure::Transient(_)
                | Failure::Fatal {
                    scope: FatalScope::Key,
                    ..
                } => {
                    self.pool.record_error(credential).await;
                }
                Failure::Fatal {
                    status,
                    message,
                    scope: FatalScope::Request,
                } => {
                    // Not retried: the request itself is bad.
                    self.pool.record_error(credential).await;
                    warn!(status, key = %selected.label, error = %message, "downstream rejected request, not retrying");
                    return Err(ExecutorError::RequestRejected {
                        status: *status,
                        message: message.clone(),
                    });
                }
            }

            warn!(
                attempt = attempts,
                max_attempts,
                key = %selected.label,
                outcome = failure.label(),
                error = %failure,
                "attempt failed"
            );
            last = Some(failure);
        }

        let last = last.unwrap_or_else(|| Failure::Transient("no attempt completed".into()));
        warn!(attempts, error = %last, "all attempts failed");
        Err(ExecutorError::AllAttemptsFailed { attempts, last })
    }
}
