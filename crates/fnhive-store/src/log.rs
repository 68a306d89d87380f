//! Append-only execution audit log.

use crate::error::StoreError;
use crate::models::ExecutionRecord;

/// Execution log contract: append-only, no reader-writer conflicts.
pub trait ExecutionLog: Send + Sync {
    /// Append one terminated-invocation record.
    fn append(&self, record: ExecutionRecord) -> Result<(), StoreError>;

    /// Most recent records first, at most `limit`.
    fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Most recent records for one owner, at most `limit`.
    fn list_for_owner(&self, owner_id: &str, limit: usize)
        -> Result<Vec<ExecutionRecord>, StoreError>;
}
