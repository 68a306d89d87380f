//! In-memory store implementations for tests and embedded use.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};

use crate::error::StoreError;
use crate::log::ExecutionLog;
use crate::models::{ExecutionRecord, UserQuota};
use crate::quota::QuotaStore;

/// Mutex-guarded quota rows, matching the SQLite store's semantics.
#[derive(Default)]
pub struct InMemoryQuotaStore {
    rows: Mutex<HashMap<String, UserQuota>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_rows<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, UserQuota>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Quota("lock poisoned".to_string()))?;
        f(&mut rows)
    }

    fn with_row<T>(
        &self,
        owner_id: &str,
        f: impl FnOnce(&mut UserQuota) -> T,
    ) -> Result<T, StoreError> {
        self.with_rows(|rows| {
            let row = rows
                .get_mut(owner_id)
                .ok_or_else(|| StoreError::Quota(format!("unknown owner: {owner_id}")))?;
            Ok(f(row))
        })
    }
}

impl QuotaStore for InMemoryQuotaStore {
    fn get(&self, owner_id: &str) -> Result<Option<UserQuota>, StoreError> {
        self.with_rows(|rows| Ok(rows.get(owner_id).cloned()))
    }

    fn init(&self, owner_id: &str) -> Result<(), StoreError> {
        self.with_rows(|rows| {
            rows.entry(owner_id.to_string()).or_insert_with(|| UserQuota {
                owner_id: owner_id.to_string(),
                cpu_time_used_ms: 0,
                concurrent_count: 0,
                last_reset_at: Utc::now(),
            });
            Ok(())
        })
    }

    fn add_cpu_ms(&self, owner_id: &str, delta_ms: i64) -> Result<(), StoreError> {
        self.with_row(owner_id, |row| row.cpu_time_used_ms += delta_ms)
    }

    fn inc_concurrent(&self, owner_id: &str) -> Result<(), StoreError> {
        self.with_row(owner_id, |row| row.concurrent_count += 1)
    }

    fn try_inc_concurrent(&self, owner_id: &str, ceiling: i64) -> Result<bool, StoreError> {
        self.with_rows(|rows| {
            Ok(match rows.get_mut(owner_id) {
                Some(row) if row.concurrent_count < ceiling => {
                    row.concurrent_count += 1;
                    true
                }
                _ => false,
            })
        })
    }

    fn dec_concurrent(&self, owner_id: &str) -> Result<(), StoreError> {
        self.with_row(owner_id, |row| {
            row.concurrent_count = (row.concurrent_count - 1).max(0);
        })
    }

    fn reset_cpu_if_older_than(&self, interval: Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = now - interval;
        self.with_rows(|rows| {
            let mut reset = 0;
            for row in rows.values_mut() {
                if row.last_reset_at < cutoff {
                    row.cpu_time_used_ms = 0;
                    row.last_reset_at = now;
                    reset += 1;
                }
            }
            Ok(reset)
        })
    }

    fn clear_all_concurrent(&self) -> Result<u64, StoreError> {
        self.with_rows(|rows| {
            let mut cleared = 0;
            for row in rows.values_mut() {
                if row.concurrent_count != 0 {
                    row.concurrent_count = 0;
                    cleared += 1;
                }
            }
            Ok(cleared)
        })
    }
}

/// Mutex-guarded append-only record list.
#[derive(Default)]
pub struct InMemoryExecutionLog {
    rows: Mutex<Vec<ExecutionRecord>>,
}

impl InMemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ExecutionRecord>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Log("lock poisoned".to_string()))
    }
}

impl ExecutionLog for InMemoryExecutionLog {
    fn append(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.lock()?.push(record);
        Ok(())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(self.lock()?.iter().rev().take(limit).cloned().collect())
    }

    fn list_for_owner(&self, owner_id: &str, limit: usize)
        -> Result<Vec<ExecutionRecord>, StoreError>
    {
        Ok(self
            .lock()?
            .iter()
            .rev()
            .filter(|record| record.owner_id == owner_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
