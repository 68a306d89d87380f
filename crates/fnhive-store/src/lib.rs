//! Durable quota accounting and execution audit log for the fnhive engine.

pub mod error;
pub mod log;
pub mod memory;
pub mod models;
pub mod quota;
pub mod sqlite;

pub use error::StoreError;
pub use log::ExecutionLog;
pub use memory::{InMemoryExecutionLog, InMemoryQuotaStore};
pub use models::{ExecutionRecord, ExecutionStatus, UserQuota};
pub use quota::QuotaStore;
pub use sqlite::{SqliteExecutionLog, SqliteQuotaStore};
