//! Round-robin key selection and per-key accounting
//!
//! All mutable pool state sits behind one `tokio::sync::Mutex`. Every operation
//! takes the lock for its selection or counter update only; callers never hold
//! it across a downstream request.
//!
//! The daily reset is lazy: selection and every `record_*` call compare the
//! stored UTC date with today's and clear every key's counters on the first
//! operation of a new day. An outcome recorded after midnight for a key
//! selected before it therefore counts towards the new day.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::quota::QuotaPolicy;
use crate::record::KeyRecord;

/// Source of the current time, injectable for day-boundary tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar day that quota windows are keyed on.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A key handed out by the pool for one attempt.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    /// Index in rotation order.
    pub position: usize,
    pub credential: Secret<String>,
    /// Redacted identifier for logs.
    pub label: String,
}

pub(crate) struct PoolState {
    pub(crate) records: Vec<KeyRecord>,
    cursor: usize,
    pub(crate) last_reset_date: NaiveDate,
}

impl PoolState {
    fn find_mut(&mut self, credential: &str) -> Option<&mut KeyRecord> {
        self.records.iter_mut().find(|r| r.matches(credential))
    }

    fn exhausted_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_exhausted()).count()
    }

    /// Scan at most one full rotation from the cursor. Keys in `tried` are only
    /// returned when no untried usable key exists.
    fn select(&mut self, tried: &[usize]) -> Option<usize> {
        let n = self.records.len();
        let mut fallback = None;
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            if self.records[idx].is_exhausted() {
                continue;
            }
            if tried.contains(&idx) {
                fallback.get_or_insert(idx);
                continue;
            }
            self.cursor = (idx + 1) % n;
            return Some(idx);
        }
        let idx = fallback?;
        self.cursor = (idx + 1) % n;
        Some(idx)
    }

    fn reset_all(&mut self, today: NaiveDate) {
        for record in &mut self.records {
            record.reset();
        }
        self.last_reset_date = today;
    }
}

/// Fixed, ordered pool of API keys.
pub struct KeyPool {
    state: Mutex<PoolState>,
    policy: QuotaPolicy,
    clock: Arc<dyn Clock>,
    size: usize,
}

impl KeyPool {
    /// Create a pool using the system clock.
    ///
    /// Rotation order follows `credentials`. Duplicate credentials are dropped so
    /// every key maps to exactly one record.
    pub fn new(credentials: Vec<Secret<String>>, policy: QuotaPolicy) -> Self {
        Self::with_clock(credentials, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        credentials: Vec<Secret<String>>,
        policy: QuotaPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut records: Vec<KeyRecord> = Vec::with_capacity(credentials.len());
        for credential in credentials {
            if records.iter().any(|r| r.matches(credential.expose())) {
                warn!(key = %credential.redacted(), "duplicate key ignored");
                continue;
            }
            records.push(KeyRecord::new(credential));
        }

        let size = records.len();
        let today = clock.today();
        info!(
            keys = size,
            daily_limit = policy.daily_limit,
            soft_ceiling = policy.soft_ceiling,
            error_threshold = policy.error_threshold,
            "key pool initialized"
        );
        Self {
            state: Mutex::new(PoolState {
                records,
                cursor: 0,
                last_reset_date: today,
            }),
            policy,
            clock,
            size,
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Number of keys. Fixed for the pool's lifetime.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Select the next usable key in rotation order.
    ///
    /// Returns `NoneAvailable` when every key is exhausted for the day.
    pub async fn next(&self) -> Result<SelectedKey> {
        self.next_excluding(&[]).await
    }

    /// Select the next usable key, preferring keys whose positions are not in
    /// `tried`. An already-tried key is returned only if it is the sole usable one.
    pub async fn next_excluding(&self, tried: &[usize]) -> Result<SelectedKey> {
        let mut state = self.state.lock().await;
        self.reset_if_new_day(&mut state);

        match state.select(tried) {
            Some(position) => {
                let record = &state.records[position];
                debug!(key = record.label(), position, "key selected");
                Ok(SelectedKey {
                    position,
                    credential: record.credential().clone(),
                    label: record.label().to_string(),
                })
            }
            None => Err(Error::NoneAvailable {
                total: state.records.len(),
                exhausted: state.exhausted_count(),
            }),
        }
    }

    /// Reset all counters if the UTC date changed since the last reset.
    ///
    /// Returns true if a reset happened. Safe to call any number of times.
    pub async fn maybe_reset(&self) -> bool {
        let mut state = self.state.lock().await;
        self.reset_if_new_day(&mut state)
    }

    /// Reset all counters now, regardless of date.
    pub async fn force_reset(&self) {
        let mut state = self.state.lock().await;
        let today = self.clock.today();
        state.reset_all(today);
        metrics::counter!("key_pool_resets_total", "trigger" => "manual").increment(1);
        info!(date = %today, keys = state.records.len(), "key pool reset manually");
    }

    /// Record a successful call that consumed `units` quota units.
    pub async fn record_success(&self, credential: &str, units: u64) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        self.reset_if_new_day(&mut state);
        let Some(record) = state.find_mut(credential) else {
            warn!("success reported for unknown key");
            return;
        };
        if record.apply_success(units, now, &self.policy) {
            metrics::counter!("key_pool_keys_exhausted_total", "reason" => "soft_ceiling")
                .increment(1);
            info!(
                key = record.label(),
                used_today = record.used_today(),
                "key exhausted (soft ceiling reached)"
            );
        }
    }

    /// Record a quota-exceeded signal from the downstream; the key is exhausted
    /// immediately whatever its local usage count says.
    pub async fn record_quota_exceeded(&self, credential: &str) {
        let mut state = self.state.lock().await;
        self.reset_if_new_day(&mut state);
        let Some(record) = state.find_mut(credential) else {
            warn!("quota exhaustion reported for unknown key");
            return;
        };
        if record.exhaust() {
            metrics::counter!("key_pool_keys_exhausted_total", "reason" => "quota_exceeded")
                .increment(1);
            info!(
                key = record.label(),
                used_today = record.used_today(),
                "key exhausted (downstream quota exceeded)"
            );
        }
    }

    /// Record a non-quota failure; the key is disabled at the error threshold.
    pub async fn record_error(&self, credential: &str) {
        let mut state = self.state.lock().await;
        self.reset_if_new_day(&mut state);
        let Some(record) = state.find_mut(credential) else {
            warn!("error reported for unknown key");
            return;
        };
        if record.apply_error(&self.policy) {
            metrics::counter!("key_pool_keys_exhausted_total", "reason" => "errors").increment(1);
            warn!(
                key = record.label(),
                consecutive_errors = record.consecutive_errors(),
                "key disabled (error threshold reached)"
            );
        } else {
            debug!(
                key = record.label(),
                consecutive_errors = record.consecutive_errors(),
                "key error recorded"
            );
        }
    }

    /// Run `f` against a consistent view of the pool state.
    pub(crate) async fn inspect<R>(&self, f: impl FnOnce(&PoolState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    fn reset_if_new_day(&self, state: &mut PoolState) -> bool {
        let today = self.clock.today();
        if state.last_reset_date == today {
            return false;
        }
        let previous = state.last_reset_date;
        state.reset_all(today);
        metrics::counter!("key_pool_resets_total", "trigger" => "daily").increment(1);
        info!(
            previous = %previous,
            date = %today,
            keys = state.records.len(),
            "daily quota reset"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ManualClock, keys};
    use std::collections::HashMap;

    fn pool(n: usize) -> KeyPool {
        KeyPool::new(keys(n), QuotaPolicy::default())
    }

    fn pool_with_clock(n: usize, clock: Arc<ManualClock>) -> KeyPool {
        KeyPool::with_clock(keys(n), QuotaPolicy::default(), clock)
    }

    async fn record_of(pool: &KeyPool, position: usize) -> KeyRecord {
        pool.inspect(|s| s.records[position].clone()).await
    }

    #[tokio::test]
    async fn round_robin_cycles_in_pool_order() {
        let pool = pool(3);
        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(pool.next().await.unwrap().position);
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn rotation_is_fair_over_many_calls() {
        let pool = pool(4);
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..103 {
            *counts.entry(pool.next().await.unwrap().position).or_default() += 1;
        }
        for position in 0..4 {
            let count = counts[&position];
            assert!((25..=26).contains(&count), "key {position} selected {count} times");
        }
    }

    #[tokio::test]
    async fn exhausted_key_is_never_returned_until_reset() {
        let pool = pool(3);
        let first = pool.next().await.unwrap();
        pool.record_quota_exceeded(first.credential.expose()).await;

        for _ in 0..10 {
            let selected = pool.next().await.unwrap();
            assert_ne!(selected.position, 0);
        }

        pool.force_reset().await;
        let positions: Vec<usize> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                v.push(pool.next().await.unwrap().position);
            }
            v
        };
        assert!(positions.contains(&0), "key 0 usable again after reset");
    }

    #[tokio::test]
    async fn all_exhausted_returns_none_available() {
        let pool = pool(2);
        for key in keys(2) {
            pool.record_quota_exceeded(key.expose()).await;
        }

        let err = pool.next().await.unwrap_err();
        assert_eq!(
            err,
            Error::NoneAvailable {
                total: 2,
                exhausted: 2
            }
        );
    }

    #[tokio::test]
    async fn empty_pool_returns_none_available() {
        let pool = KeyPool::new(vec![], QuotaPolicy::default());
        assert!(pool.is_empty());
        assert!(matches!(
            pool.next().await,
            Err(Error::NoneAvailable { total: 0, .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_credentials_are_dropped() {
        let mut credentials = keys(2);
        credentials.push(credentials[0].clone());
        let pool = KeyPool::new(credentials, QuotaPolicy::default());
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn soft_ceiling_trigger() {
        let pool = pool(1);
        let key = keys(1).remove(0);

        pool.record_success(key.expose(), 9_499).await;
        pool.record_success(key.expose(), 0).await;
        assert!(!record_of(&pool, 0).await.is_exhausted());

        pool.record_success(key.expose(), 1).await;
        let record = record_of(&pool, 0).await;
        assert!(record.is_exhausted());
        assert_eq!(record.used_today(), 9_500);
    }

    #[tokio::test]
    async fn success_updates_last_used_at() {
        let clock = Arc::new(ManualClock::at("2026-03-01T10:00:00Z"));
        let pool = pool_with_clock(1, clock.clone());
        let key = keys(1).remove(0);

        pool.record_success(key.expose(), 5).await;
        assert_eq!(record_of(&pool, 0).await.last_used_at(), Some(clock.now()));
    }

    #[tokio::test]
    async fn three_consecutive_errors_disable_key() {
        let pool = pool(2);
        let key = keys(1).remove(0);

        pool.record_error(key.expose()).await;
        pool.record_error(key.expose()).await;
        assert!(!record_of(&pool, 0).await.is_exhausted());
        pool.record_error(key.expose()).await;
        assert!(record_of(&pool, 0).await.is_exhausted());
    }

    #[tokio::test]
    async fn success_between_errors_resets_counter() {
        let pool = pool(1);
        let key = keys(1).remove(0);

        pool.record_error(key.expose()).await;
        pool.record_error(key.expose()).await;
        pool.record_success(key.expose(), 1).await;
        pool.record_error(key.expose()).await;
        pool.record_error(key.expose()).await;

        let record = record_of(&pool, 0).await;
        assert_eq!(record.consecutive_errors(), 2);
        assert!(!record.is_exhausted());
        assert!(pool.next().await.is_ok());
    }

    #[tokio::test]
    async fn quota_exceeded_is_authoritative_over_local_count() {
        let pool = pool(1);
        let key = keys(1).remove(0);
        pool.record_success(key.expose(), 10).await;
        pool.record_quota_exceeded(key.expose()).await;

        let record = record_of(&pool, 0).await;
        assert!(record.is_exhausted());
        assert_eq!(record.used_today(), 10);
    }

    #[tokio::test]
    async fn unknown_credential_is_ignored() {
        let pool = pool(1);
        pool.record_success("not-a-pool-key-at-all", 100).await;
        pool.record_error("not-a-pool-key-at-all").await;
        pool.record_quota_exceeded("not-a-pool-key-at-all").await;

        let record = record_of(&pool, 0).await;
        assert_eq!(record.used_today(), 0);
        assert!(!record.is_exhausted());
    }

    #[tokio::test]
    async fn next_excluding_prefers_untried_keys() {
        let pool = pool(3);
        // Cursor at 0; 0 and 1 already tried this call
        let selected = pool.next_excluding(&[0, 1]).await.unwrap();
        assert_eq!(selected.position, 2);
    }

    #[tokio::test]
    async fn next_excluding_falls_back_to_tried_key() {
        let pool = pool(2);
        let selected = pool.next_excluding(&[0, 1]).await.unwrap();
        assert_eq!(selected.position, 0);
        assert_eq!(pool.next().await.unwrap().position, 1);
    }

    #[tokio::test]
    async fn new_day_resets_on_next_selection() {
        let clock = Arc::new(ManualClock::at("2026-03-01T23:59:00Z"));
        let pool = pool_with_clock(2, clock.clone());
        for key in keys(2) {
            pool.record_success(key.expose(), 9_600).await;
        }
        assert!(pool.next().await.is_err());

        clock.set("2026-03-02T00:00:01Z");
        let selected = pool.next().await.unwrap();
        assert_eq!(selected.position, 0);

        let record = record_of(&pool, 0).await;
        assert_eq!(record.used_today(), 0);
        assert!(!record.is_exhausted());
        assert_eq!(
            pool.inspect(|s| s.last_reset_date).await,
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
        );
    }

    #[tokio::test]
    async fn outcome_recorded_after_midnight_counts_towards_new_day() {
        let clock = Arc::new(ManualClock::at("2026-03-01T23:59:59Z"));
        let pool = pool_with_clock(2, clock.clone());
        let credentials = keys(2);
        pool.record_success(credentials[0].expose(), 300).await;
        pool.record_quota_exceeded(credentials[1].expose()).await;

        // Selected before midnight, answered after it
        let selected = pool.next().await.unwrap();
        assert_eq!(selected.position, 0);
        clock.set("2026-03-02T00:00:02Z");
        pool.record_success(selected.credential.expose(), 10).await;

        let record = record_of(&pool, 0).await;
        assert_eq!(record.used_today(), 10);
        assert!(!record_of(&pool, 1).await.is_exhausted());
        assert_eq!(
            pool.inspect(|s| s.last_reset_date).await,
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
        );

        // The following selection does not wipe it again
        pool.next().await.unwrap();
        assert_eq!(record_of(&pool, 0).await.used_today(), 10);
    }

    #[tokio::test]
    async fn errors_recorded_after_midnight_start_from_zero() {
        let clock = Arc::new(ManualClock::at("2026-03-01T23:59:59Z"));
        let pool = pool_with_clock(1, clock.clone());
        let key = keys(1).remove(0);
        pool.record_error(key.expose()).await;
        pool.record_error(key.expose()).await;

        clock.set("2026-03-02T00:00:01Z");
        pool.record_error(key.expose()).await;

        let record = record_of(&pool, 0).await;
        assert_eq!(record.consecutive_errors(), 1);
        assert!(!record.is_exhausted());
    }

    #[tokio::test]
    async fn maybe_reset_is_idempotent_within_a_day() {
        let clock = Arc::new(ManualClock::at("2026-03-01T08:00:00Z"));
        let pool = pool_with_clock(1, clock.clone());
        let key = keys(1).remove(0);

        assert!(!pool.maybe_reset().await, "same day as construction");

        clock.set("2026-03-02T00:10:00Z");
        assert!(pool.maybe_reset().await);

        pool.record_success(key.expose(), 42).await;
        pool.record_error(key.expose()).await;

        clock.set("2026-03-02T18:00:00Z");
        assert!(!pool.maybe_reset().await);
        assert!(!pool.maybe_reset().await);

        let record = record_of(&pool, 0).await;
        assert_eq!(record.used_today(), 42);
        assert_eq!(record.consecutive_errors(), 1);
    }

    #[tokio::test]
    async fn force_reset_clears_all_counters() {
        let pool = pool(2);
        for key in keys(2) {
            pool.record_success(key.expose(), 500).await;
            pool.record_quota_exceeded(key.expose()).await;
        }
        pool.force_reset().await;

        for position in 0..2 {
            let record = record_of(&pool, position).await;
            assert_eq!(record.used_today(), 0);
            assert!(!record.is_exhausted());
        }
    }

    #[tokio::test]
    async fn concurrent_selection_spreads_across_keys() {
        let pool = Arc::new(pool(4));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..40 {
            let pool = pool.clone();
            tasks.spawn(async move { pool.next().await.unwrap().position });
        }

        let mut counts = [0usize; 4];
        while let Some(position) = tasks.join_next().await {
            counts[position.unwrap()] += 1;
        }
        assert_eq!(counts, [10, 10, 10, 10]);
    }
}
