//! Refresh coordinator counters. Observability only; nothing branches on them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RefreshMetrics {
    refresh_attempts: AtomicU64,
    refresh_successes: AtomicU64,
    refresh_failures: AtomicU64,
    reauth_required: AtomicU64,
    deduplicated_joins: AtomicU64,
    vault_writes: AtomicU64,
    vault_write_failures: AtomicU64,
    lease_waits: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshMetricsSnapshot {
    pub refresh_attempts: u64,
    pub refresh_successes: u64,
    pub refresh_failures: u64,
    pub reauth_required: u64,
    /// Callers that attached to an in-flight refresh instead of starting one.
    pub deduplicated_joins: u64,
    pub vault_writes: u64,
    pub vault_write_failures: u64,
    /// Refreshes that waited on another process holding the lease.
    pub lease_waits: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl RefreshMetrics {
            $(
                #[inline]
                pub(crate) fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    record_attempt => refresh_attempts,
    record_success => refresh_successes,
    record_failure => refresh_failures,
    record_reauth => reauth_required,
    record_join => deduplicated_joins,
    record_vault_write => vault_writes,
    record_vault_write_failure => vault_write_failures,
    record_lease_wait => lease_waits,
}

impl RefreshMetrics {
    pub fn snapshot(&self) -> RefreshMetricsSnapshot {
        RefreshMetricsSnapshot {
            refresh_attempts: self.refresh_attempts.load(Ordering::Relaxed),
            refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            reauth_required: self.reauth_required.load(Ordering::Relaxed),
            deduplicated_joins: self.deduplicated_joins.load(Ordering::Relaxed),
            vault_writes: self.vault_writes.load(Ordering::Relaxed),
            vault_write_failures: self.vault_write_failures.load(Ordering::Relaxed),
            lease_waits: self.lease_waits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = RefreshMetrics::default();
        metrics.record_attempt();
        metrics.record_attempt();
        metrics.record_join();
        let snap = metrics.snapshot();
        assert_eq!(snap.refresh_attempts, 2);
        assert_eq!(snap.deduplicated_joins, 1);
        assert_eq!(snap.vault_writes, 0);
    }
}
