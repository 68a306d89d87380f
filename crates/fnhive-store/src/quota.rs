//! Storage façade for per-user quota rows.

use chrono::Duration;

use crate::error::StoreError;
use crate::models::UserQuota;

/// Quota store contract used by admission control and the orchestrator.
///
/// Implementations are responsible for making counter updates atomic:
/// - `add_cpu_ms`, `inc_concurrent`, and `dec_concurrent` must each be a
///   single atomic read-modify-write; concurrent updates to the same row
///   are serialized by the store.
/// - `dec_concurrent` must clamp at zero so `concurrent_count >= 0` holds
///   for all traces.
/// - `init` must be idempotent; re-initializing an existing owner leaves
///   its counters untouched.
pub trait QuotaStore: Send + Sync {
    /// Read the quota row for an owner, or `None` when never initialized.
    fn get(&self, owner_id: &str) -> Result<Option<UserQuota>, StoreError>;

    /// Idempotent create with zero counters.
    fn init(&self, owner_id: &str) -> Result<(), StoreError>;

    /// Atomically add elapsed wall-clock milliseconds to the CPU budget.
    fn add_cpu_ms(&self, owner_id: &str, delta_ms: i64) -> Result<(), StoreError>;

    /// Atomically increment the in-flight execution count.
    fn inc_concurrent(&self, owner_id: &str) -> Result<(), StoreError>;

    /// Atomically increment the in-flight execution count only while it is
    /// below `ceiling`; returns whether the slot was reserved. An unknown
    /// owner reserves nothing. The check-and-increment must be one atomic
    /// row update so concurrent admissions for the same owner cannot race
    /// past the ceiling, and admissions for different owners never contend.
    fn try_inc_concurrent(&self, owner_id: &str, ceiling: i64) -> Result<bool, StoreError>;

    /// Atomically decrement the in-flight execution count, clamping at zero.
    fn dec_concurrent(&self, owner_id: &str) -> Result<(), StoreError>;

    /// Administrative reset: zero `cpu_time_used_ms` for rows whose
    /// `last_reset_at` is older than `now - interval`. Returns rows reset.
    fn reset_cpu_if_older_than(&self, interval: Duration) -> Result<u64, StoreError>;

    /// Zero every row's `concurrent_count`. Used at engine start on a
    /// single-node deployment, where a restart means nothing is in flight
    /// and any nonzero count is a stale leak from a crash. Returns rows
    /// changed.
    fn clear_all_concurrent(&self) -> Result<u64, StoreError>;
}
