//! Engine request and result surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fnhive_store::ExecutionStatus;

/// One validated invocation handed to the engine by the front-end
/// collaborator. Consumed once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub function_id: String,
    pub owner_id: String,
    pub source_code: String,
    pub input: Option<Value>,
}

/// Structured invocation result returned to the caller.
///
/// `status == Success` implies `output` is set and `error` is absent;
/// `status == Error` implies the reverse. The constructors enforce this.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn success(output: String, elapsed_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output: Some(output),
            error: None,
            elapsed_ms,
        }
    }

    pub fn failure(error: String, elapsed_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Error,
            output: None,
            error: Some(error),
            elapsed_ms,
        }
    }
}
