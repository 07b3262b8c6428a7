//! Read-only pool status for the admin surface
//!
//! Snapshots are taken under the pool lock so the per-key rows and the totals
//! agree with each other. Taking one never changes pool state, not even the
//! lazy daily reset.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::pool::KeyPool;

/// Overall pool health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    /// Every key usable.
    Healthy,
    /// Some keys exhausted.
    Degraded,
    /// No usable key (or no keys at all).
    Unhealthy,
}

impl PoolHealth {
    pub fn label(&self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Degraded => "degraded",
            PoolHealth::Unhealthy => "unhealthy",
        }
    }
}

/// One key's row. The credential appears only as a redacted suffix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeySnapshot {
    pub position: usize,
    pub key: String,
    pub used_today: u64,
    pub remaining: u64,
    pub is_exhausted: bool,
    pub consecutive_errors: u32,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub status: PoolHealth,
    pub total_keys: usize,
    pub active_keys: usize,
    pub exhausted_keys: usize,
    pub total_capacity: u64,
    pub total_used: u64,
    pub percent_used: f64,
    pub last_reset_date: NaiveDate,
    pub keys: Vec<KeySnapshot>,
}

/// Aggregates pool state for observability.
#[derive(Clone)]
pub struct StatusReporter {
    pool: Arc<KeyPool>,
}

impl StatusReporter {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self { pool }
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let policy = *self.pool.policy();
        self.pool
            .inspect(|state| {
                let keys: Vec<KeySnapshot> = state
                    .records
                    .iter()
                    .enumerate()
                    .map(|(position, r)| KeySnapshot {
                        position,
                        key: r.label().to_string(),
                        used_today: r.used_today(),
                        remaining: policy.remaining(r.used_today()),
                        is_exhausted: r.is_exhausted(),
                        consecutive_errors: r.consecutive_errors(),
                        last_used_at: r.last_used_at(),
                    })
                    .collect();

                let total_keys = keys.len();
                let exhausted_keys = keys.iter().filter(|k| k.is_exhausted).count();
                let active_keys = total_keys - exhausted_keys;
                let total_capacity = policy.capacity(total_keys);
                let total_used: u64 = keys.iter().map(|k| k.used_today).sum();
                let percent_used = if total_capacity == 0 {
                    0.0
                } else {
                    let raw = total_used as f64 / total_capacity as f64 * 100.0;
                    (raw * 100.0).round() / 100.0
                };
                let status = if total_keys > 0 && active_keys == total_keys {
                    PoolHealth::Healthy
                } else if active_keys > 0 {
                    PoolHealth::Degraded
                } else {
                    PoolHealth::Unhealthy
                };

                PoolSnapshot {
                    status,
                    total_keys,
                    active_keys,
                    exhausted_keys,
                    total_capacity,
                    total_used,
                    percent_used,
                    last_reset_date: state.last_reset_date,
                    keys,
                }
            })
            .await
    }
}
