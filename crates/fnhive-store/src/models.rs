//! Domain records for quota accounting and execution audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal status of one invocation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Per-user durable quota row.
///
/// `cpu_time_used_ms` is monotonically nondecreasing between administrative
/// resets; `concurrent_count` never goes below zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserQuota {
    pub owner_id: String,
    pub cpu_time_used_ms: i64,
    pub concurrent_count: i64,
    pub last_reset_at: DateTime<Utc>,
}

/// One append-only audit row for a terminated invocation.
///
/// Exactly one row exists per admitted invocation; admission-rejected
/// requests are never logged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub function_id: String,
    pub owner_id: String,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}
