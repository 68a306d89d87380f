//! SQLite-backed quota store and execution log.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::log::ExecutionLog;
use crate::models::{ExecutionRecord, ExecutionStatus, UserQuota};
use crate::quota::QuotaStore;

fn map_quota_err(prefix: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Quota(format!("{prefix}: {err}"))
}

fn map_log_err(prefix: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Log(format!("{prefix}: {err}"))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn decode_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn open_connection(db_path: &Path, on_err: fn(&str, String) -> StoreError)
    -> Result<Connection, StoreError>
{
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| on_err("create parent dir", e.to_string()))?;
    }
    let conn =
        Connection::open(db_path).map_err(|e| on_err("open sqlite db", e.to_string()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| on_err("set journal_mode", e.to_string()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| on_err("set synchronous", e.to_string()))?;
    Ok(conn)
}

/// SQLite-backed per-user quota rows.
#[derive(Clone)]
pub struct SqliteQuotaStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQuotaStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = open_connection(&path, |p, e| map_quota_err(p, e))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS user_quotas (
                owner_id TEXT PRIMARY KEY,
                cpu_time_used_ms INTEGER NOT NULL DEFAULT 0,
                concurrent_count INTEGER NOT NULL DEFAULT 0,
                last_reset_at_ms INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| map_quota_err("ensure schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| map_quota_err("lock poisoned", "mutex poisoned"))
    }

    /// Run an UPDATE that must touch exactly one owner row.
    fn update_owner_row(&self, owner_id: &str, sql: &str, delta: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(sql, params![owner_id, delta])
            .map_err(|e| map_quota_err("update quota row", e))?;
        if changed == 0 {
            return Err(StoreError::Quota(format!("unknown owner: {owner_id}")));
        }
        Ok(())
    }
}

impl QuotaStore for SqliteQuotaStore {
    fn get(&self, owner_id: &str) -> Result<Option<UserQuota>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT cpu_time_used_ms, concurrent_count, last_reset_at_ms
                 FROM user_quotas WHERE owner_id = ?1",
                params![owner_id],
                |row| {
                    let cpu: i64 = row.get(0)?;
                    let concurrent: i64 = row.get(1)?;
                    let reset_ms: i64 = row.get(2)?;
                    Ok((cpu, concurrent, reset_ms))
                },
            )
            .optional()
            .map_err(|e| map_quota_err("read quota row", e))?;
        Ok(row.map(|(cpu, concurrent, reset_ms)| UserQuota {
            owner_id: owner_id.to_string(),
            cpu_time_used_ms: cpu,
            concurrent_count: concurrent,
            last_reset_at: decode_ms(reset_ms),
        }))
    }

    fn init(&self, owner_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_quotas
             (owner_id, cpu_time_used_ms, concurrent_count, last_reset_at_ms)
             VALUES (?1, 0, 0, ?2)",
            params![owner_id, now_ms()],
        )
        .map_err(|e| map_quota_err("init quota row", e))?;
        Ok(())
    }

    fn add_cpu_ms(&self, owner_id: &str, delta_ms: i64) -> Result<(), StoreError> {
        self.update_owner_row(
            owner_id,
            "UPDATE user_quotas SET cpu_time_used_ms = cpu_time_used_ms + ?2
             WHERE owner_id = ?1",
            delta_ms,
        )
    }

    fn inc_concurrent(&self, owner_id: &str) -> Result<(), StoreError> {
        self.update_owner_row(
            owner_id,
            "UPDATE user_quotas SET concurrent_count = concurrent_count + ?2
             WHERE owner_id = ?1",
            1,
        )
    }

    fn try_inc_concurrent(&self, owner_id: &str, ceiling: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE user_quotas SET concurrent_count = concurrent_count + 1
                 WHERE owner_id = ?1 AND concurrent_count < ?2",
                params![owner_id, ceiling],
            )
            .map_err(|e| map_quota_err("reserve concurrency slot", e))?;
        Ok(changed > 0)
    }

    fn dec_concurrent(&self, owner_id: &str) -> Result<(), StoreError> {
        self.update_owner_row(
            owner_id,
            "UPDATE user_quotas SET concurrent_count = MAX(concurrent_count - ?2, 0)
             WHERE owner_id = ?1",
            1,
        )
    }

    fn reset_cpu_if_older_than(&self, interval: Duration) -> Result<u64, StoreError> {
        let now = now_ms();
        let cutoff = now - interval.num_milliseconds();
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE user_quotas SET cpu_time_used_ms = 0, last_reset_at_ms = ?1
                 WHERE last_reset_at_ms < ?2",
                params![now, cutoff],
            )
            .map_err(|e| map_quota_err("reset cpu budgets", e))?;
        Ok(changed as u64)
    }

    fn clear_all_concurrent(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE user_quotas SET concurrent_count = 0 WHERE concurrent_count != 0",
                [],
            )
            .map_err(|e| map_quota_err("clear concurrent counts", e))?;
        Ok(changed as u64)
    }
}

/// SQLite-backed append-only execution log.
#[derive(Clone)]
pub struct SqliteExecutionLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutionLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = open_connection(&path, |p, e| map_log_err(p, e))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS execution_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                function_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                elapsed_ms INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_execution_log_owner
            ON execution_log (owner_id, id DESC);
            ",
        )
        .map_err(|e| map_log_err("ensure schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| map_log_err("lock poisoned", "mutex poisoned"))
    }

    fn query_records(&self, sql: &str, args: &[&dyn rusqlite::ToSql])
        -> Result<Vec<ExecutionRecord>, StoreError>
    {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(|e| map_log_err("prepare list", e))?;
        let rows = stmt
            .query_map(args, |row| {
                let function_id: String = row.get(0)?;
                let owner_id: String = row.get(1)?;
                let status: String = row.get(2)?;
                let output: Option<String> = row.get(3)?;
                let error: Option<String> = row.get(4)?;
                let elapsed_ms: i64 = row.get(5)?;
                let created_at_ms: i64 = row.get(6)?;
                Ok((function_id, owner_id, status, output, error, elapsed_ms, created_at_ms))
            })
            .map_err(|e| map_log_err("query list", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (function_id, owner_id, status, output, error, elapsed_ms, created_at_ms) =
                row.map_err(|e| map_log_err("row decode", e))?;
            let status = ExecutionStatus::from_str(&status)
                .ok_or_else(|| StoreError::Log(format!("invalid status: {status}")))?;
            out.push(ExecutionRecord {
                function_id,
                owner_id,
                status,
                output,
                error,
                elapsed_ms: elapsed_ms.max(0) as u64,
                created_at: decode_ms(created_at_ms),
            });
        }
        Ok(out)
    }
}

impl ExecutionLog for SqliteExecutionLog {
    fn append(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO execution_log
             (function_id, owner_id, status, output, error, elapsed_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.function_id,
                record.owner_id,
                record.status.as_str(),
                record.output,
                record.error,
                record.elapsed_ms as i64,
                record.created_at.timestamp_millis(),
            ],
        )
        .map_err(|e| map_log_err("insert record", e))?;
        Ok(())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.query_records(
            "SELECT function_id, owner_id, status, output, error, elapsed_ms, created_at_ms
             FROM execution_log ORDER BY id DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    fn list_for_owner(&self, owner_id: &str, limit: usize)
        -> Result<Vec<ExecutionRecord>, StoreError>
    {
        self.query_records(
            "SELECT function_id, owner_id, status, output, error, elapsed_ms, created_at_ms
             FROM execution_log WHERE owner_id = ?1 ORDER BY id DESC LIMIT ?2",
            params![owner_id, limit as i64],
        )
    }
}
