//! Per-key credential and usage counters

use chrono::{DateTime, Utc};
use common::Secret;

use crate::quota::QuotaPolicy;

/// One API key and its usage for the current day.
///
/// Invariants, maintained by the mutators below:
/// - `is_exhausted` only goes back to false through `reset`
/// - `consecutive_errors >= policy.error_threshold` implies `is_exhausted`
#[derive(Debug, Clone)]
pub struct KeyRecord {
    credential: Secret<String>,
    label: String,
    used_today: u64,
    last_used_at: Option<DateTime<Utc>>,
    is_exhausted: bool,
    consecutive_errors: u32,
}

impl KeyRecord {
    pub fn new(credential: Secret<String>) -> Self {
        let label = credential.redacted();
        Self {
            credential,
            label,
            used_today: 0,
            last_used_at: None,
            is_exhausted: false,
            consecutive_errors: 0,
        }
    }

    pub fn credential(&self) -> &Secret<String> {
        &self.credential
    }

    /// Redacted key identifier for logs and status output.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn used_today(&self) -> u64 {
        self.used_today
    }

    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        self.last_used_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.is_exhausted
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub(crate) fn matches(&self, credential: &str) -> bool {
        self.credential.expose() == credential
    }

    /// Add consumed units after a successful call. Returns true if this call
    /// pushed the key over the soft ceiling.
    pub(crate) fn apply_success(
        &mut self,
        units: u64,
        now: DateTime<Utc>,
        policy: &QuotaPolicy,
    ) -> bool {
        self.used_today = self.used_today.saturating_add(units);
        self.consecutive_errors = 0;
        self.last_used_at = Some(now);
        !self.is_exhausted && policy.soft_ceiling_reached(self.used_today) && self.exhaust()
    }

    /// Count a non-quota failure. Returns true if this failure disabled the key.
    pub(crate) fn apply_error(&mut self, policy: &QuotaPolicy) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        policy.error_threshold_reached(self.consecutive_errors) && self.exhaust()
    }

    /// Mark exhausted. Returns true if the key was usable before.
    pub(crate) fn exhaust(&mut self) -> bool {
        let newly = !self.is_exhausted;
        self.is_exhausted = true;
        newly
    }

    /// Start a new day.
    pub(crate) fn reset(&mut self) {
        self.used_today = 0;
        self.is_exhausted = false;
        self.consecutive_errors = 0;
    }
}
