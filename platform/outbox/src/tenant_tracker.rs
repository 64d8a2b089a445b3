//! Per-tenant failure isolation.
//!
//! One tenant whose events keep failing (bad downstream, malformed data)
//! should not keep the dispatcher busy retrying its rows at the same pace as
//! everyone else's. The tracker counts failures per tenant over a sliding
//! window; once a tenant crosses the threshold its retries are pushed further
//! out by a fixed penalty.
//!
//! Process-local and best effort: a restart forgets every count.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantPenaltyConfig {
    pub threshold: usize,
    pub window: Duration,
    pub penalty: Duration,
}

impl Default for TenantPenaltyConfig {
    fn default() -> Self {
        Self {
            threshold: 20,
            window: Duration::from_secs(60),
            penalty: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct TenantFailureTracker {
    config: TenantPenaltyConfig,
    failures: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl TenantFailureTracker {
    pub fn new(config: TenantPenaltyConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> TenantPenaltyConfig {
        self.config
    }

    /// Record a failure and return the tenant's count inside the window.
    /// Tenants with nothing left inside the window are dropped on the way.
    pub fn record_failure(&self, tenant_id: &str, now: DateTime<Utc>) -> usize {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = self.cutoff(now);
        failures.retain(|_, entries| {
            Self::evict(entries, cutoff);
            !entries.is_empty()
        });
        let entries = failures.entry(tenant_id.to_string()).or_default();
        entries.push_back(now);
        Self::evict(entries, cutoff);
        entries.len()
    }

    pub fn failures_in_window(&self, tenant_id: &str, now: DateTime<Utc>) -> usize {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = self.cutoff(now);
        match failures.get_mut(tenant_id) {
            Some(entries) => {
                Self::evict(entries, cutoff);
                let count = entries.len();
                if count == 0 {
                    failures.remove(tenant_id);
                }
                count
            }
            None => 0,
        }
    }

    /// Extra delay for the tenant's next attempt, zero below the threshold
    pub fn penalty_for(&self, tenant_id: &str, now: DateTime<Utc>) -> Duration {
        if self.config.threshold > 0
            && self.failures_in_window(tenant_id, now) >= self.config.threshold
        {
            self.config.penalty
        } else {
            Duration::ZERO
        }
    }

    #[cfg(test)]
    fn tracked_tenants(&self) -> usize {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn evict(entries: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
        while entries.front().is_some_and(|t| *t <= cutoff) {
            entries.pop_front();
        }
    }
}

impl Default for TenantFailureTracker {
    fn default() -> Self {
        Self::new(TenantPenaltyConfig::default())
    }
}
