//! Rejection and failure taxonomy surfaced to callers as stable strings.

use thiserror::Error;

use fnhive_store::StoreError;

/// Why an invocation was rejected or failed. The `Display` strings are part
/// of the caller-visible contract and may be matched by tests.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Machine-wide instance ceiling hit; not the user's fault.
    #[error("Machine at capacity: maximum {0} concurrent instances reached")]
    MachineAtCapacity(usize),

    /// The caller already has the maximum number of in-flight executions.
    #[error("User concurrency limit reached: maximum {0} concurrent executions per user")]
    UserConcurrencyExceeded(i64),

    /// Cumulative CPU budget spent before admission.
    #[error("CPU time quota exhausted: {used}ms of {max}ms used")]
    UserCpuExceeded { used: i64, max: i64 },

    /// This invocation's elapsed time pushed the budget over the cap.
    #[error("execution would exceed CPU time quota")]
    CpuBudgetExceeded,

    /// No quota row exists for the owner; a setup error.
    #[error("quota not initialized for owner {0}")]
    QuotaNotInitialized(String),

    /// Hard wall-clock deadline expired and the sandbox was killed.
    #[error("Execution timeout: exceeded {0} second limit")]
    Timeout(u64),

    #[error(transparent)]
    Store(#[from] StoreError),
}
