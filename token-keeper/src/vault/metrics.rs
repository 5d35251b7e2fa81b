//! Per-operation vault latency and error counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Vault operations that are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultOp {
    Create,
    Get,
    Update,
    Store,
    Delete,
    Restore,
    List,
    Purge,
    Reencrypt,
    HealthCheck,
}

impl VaultOp {
    pub const ALL: [VaultOp; 10] = [
        Self::Create,
        Self::Get,
        Self::Update,
        Self::Store,
        Self::Delete,
        Self::Restore,
        Self::List,
        Self::Purge,
        Self::Reencrypt,
        Self::HealthCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Get => "get",
            Self::Update => "update",
            Self::Store => "store",
            Self::Delete => "delete",
            Self::Restore => "restore",
            Self::List => "list",
            Self::Purge => "purge",
            Self::Reencrypt => "reencrypt",
            Self::HealthCheck => "health_check",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
struct OpCounters {
    calls: AtomicU64,
    errors: AtomicU64,
    total_ms: AtomicU64,
    last_ms: AtomicU64,
}

/// Lock-free counters, one slot per [`VaultOp`].
#[derive(Debug, Default)]
pub struct VaultMetrics {
    ops: [OpCounters; VaultOp::ALL.len()],
}

/// Point-in-time view of one operation's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpStats {
    pub calls: u64,
    pub errors: u64,
    pub total_elapsed_ms: u64,
    pub last_elapsed_ms: u64,
}

impl OpStats {
    pub fn average_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_elapsed_ms as f64 / self.calls as f64
        }
    }
}

/// Snapshot of all vault counters keyed by operation name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VaultMetricsSnapshot {
    pub ops: BTreeMap<&'static str, OpStats>,
}

impl VaultMetricsSnapshot {
    pub fn op(&self, op: VaultOp) -> OpStats {
        self.ops.get(op.as_str()).copied().unwrap_or_default()
    }

    pub fn total_errors(&self) -> u64 {
        self.ops.values().map(|s| s.errors).sum()
    }
}

impl VaultMetrics {
    pub fn record(&self, op: VaultOp, elapsed_ms: u64, ok: bool) {
        let counters = &self.ops[op.index()];
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters.total_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        counters.last_ms.store(elapsed_ms, Ordering::Relaxed);
        if !ok {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> VaultMetricsSnapshot {
        let ops = VaultOp::ALL
            .iter()
            .map(|op| {
                let c = &self.ops[op.index()];
                (
                    op.as_str(),
                    OpStats {
                        calls: c.calls.load(Ordering::Relaxed),
                        errors: c.errors.load(Ordering::Relaxed),
                        total_elapsed_ms: c.total_ms.load(Ordering::Relaxed),
                        last_elapsed_ms: c.last_ms.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        VaultMetricsSnapshot { ops }
    }
}
