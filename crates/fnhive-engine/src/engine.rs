//! Engine orchestrator: admit, run, settle, log, release.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use fnhive_sandbox::{
    capture_stdout, CapturedResponse, ProcessSandbox, SandboxLimits, SandboxOutcome, SandboxRunner,
};
use fnhive_store::{ExecutionLog, ExecutionRecord, QuotaStore};

use crate::admission::{AdmissionController, MachineSlots};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{ExecutionRequest, ExecutionResult};

/// The execution engine. One instance per process; each invocation owns one
/// orchestration task and one sandbox child.
pub struct Engine {
    config: EngineConfig,
    slots: Arc<MachineSlots>,
    admission: AdmissionController,
    quotas: Arc<dyn QuotaStore>,
    log: Arc<dyn ExecutionLog>,
    runner: Arc<dyn SandboxRunner>,
}

impl Engine {
    /// Wire a subprocess sandbox from the configuration.
    pub fn new(
        config: EngineConfig,
        quotas: Arc<dyn QuotaStore>,
        log: Arc<dyn ExecutionLog>,
    ) -> Self {
        let limits = SandboxLimits {
            wall_ms: config.max_wall_ms,
            max_output_bytes: config.max_output_bytes,
        };
        let runner = Arc::new(ProcessSandbox::new(
            config.interpreter.clone(),
            limits,
            config.scratch_dir.clone(),
        ));
        Self::with_runner(config, quotas, log, runner)
    }

    /// Wire an arbitrary runner (test seam).
    pub fn with_runner(
        config: EngineConfig,
        quotas: Arc<dyn QuotaStore>,
        log: Arc<dyn ExecutionLog>,
        runner: Arc<dyn SandboxRunner>,
    ) -> Self {
        if config.recover_concurrency_on_start {
            match quotas.clear_all_concurrent() {
                Ok(0) => {}
                Ok(rows) => warn!(rows, "cleared stale concurrency counts from a previous run"),
                Err(err) => warn!(error = %err, "failed to clear stale concurrency counts"),
            }
        }
        let slots = Arc::new(MachineSlots::new(config.max_machine_instances));
        let admission = AdmissionController::new(
            slots.clone(),
            quotas.clone(),
            config.max_user_concurrent,
            config.max_user_cpu_ms,
        );
        Self {
            config,
            slots,
            admission,
            quotas,
            log,
            runner,
        }
    }

    /// Execute one request. Never fails: every rejection and infrastructure
    /// failure becomes an error-status result.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let ticket = match self.admission.acquire(&request.owner_id) {
            Ok(ticket) => ticket,
            Err(rejection) => {
                // Short-circuit: no sandbox, no log row, no billing.
                debug!(owner_id = %request.owner_id, rejection = %rejection, "admission rejected");
                return ExecutionResult::failure(rejection.to_string(), 0);
            }
        };

        let started = Instant::now();
        let outcome = self
            .runner
            .run(&request.source_code, request.input.clone(), self.config.max_wall_ms)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut result = self.settle_outcome(outcome, elapsed_ms);

        // Post-admission budget check against the row as it stood before
        // this run's billing. The overrun is still billed below.
        match self.quotas.get(&request.owner_id) {
            Ok(Some(quota)) => {
                if quota.cpu_time_used_ms + elapsed_ms as i64 > self.config.max_user_cpu_ms {
                    result = ExecutionResult::failure(
                        EngineError::CpuBudgetExceeded.to_string(),
                        elapsed_ms,
                    );
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(owner_id = %request.owner_id, error = %err, "failed to read quota for budget check")
            }
        }
        if let Err(err) = self.quotas.add_cpu_ms(&request.owner_id, elapsed_ms as i64) {
            warn!(owner_id = %request.owner_id, error = %err, "failed to bill cpu time");
        }

        // One log row per admitted invocation; a failed write never masks
        // the result.
        self.append_log(&request, &result);

        // The only site that decrements concurrency; Drop covers unwinds.
        ticket.release();
        result
    }

    /// In-flight sandbox count. Observability only.
    pub fn current_instance_count(&self) -> usize {
        self.slots.current()
    }

    pub fn max_instances(&self) -> usize {
        self.slots.max()
    }

    fn settle_outcome(
        &self,
        outcome: Result<SandboxOutcome, fnhive_sandbox::SandboxError>,
        elapsed_ms: u64,
    ) -> ExecutionResult {
        match outcome {
            Ok(SandboxOutcome::Completed {
                success: true,
                stdout,
                ..
            }) => {
                let output = match capture_stdout(&stdout, self.config.max_output_bytes) {
                    CapturedResponse::Envelope(envelope) => serde_json::to_string(&envelope)
                        .unwrap_or_else(|_| stdout.clone()),
                    CapturedResponse::Raw { text } => text,
                };
                ExecutionResult::success(output, elapsed_ms)
            }
            Ok(SandboxOutcome::Completed {
                success: false,
                stderr,
                exit_code,
                ..
            }) => {
                // stderr goes back to the user verbatim.
                let error = if stderr.trim().is_empty() {
                    match exit_code {
                        Some(code) => format!("function exited with status {code}"),
                        None => "function terminated by signal".to_string(),
                    }
                } else {
                    stderr
                };
                ExecutionResult::failure(error, elapsed_ms)
            }
            Ok(SandboxOutcome::TimedOut { .. }) => ExecutionResult::failure(
                EngineError::Timeout(self.config.max_wall_ms.div_ceil(1000)).to_string(),
                elapsed_ms,
            ),
            Err(err) => ExecutionResult::failure(err.to_string(), elapsed_ms),
        }
    }

    fn append_log(&self, request: &ExecutionRequest, result: &ExecutionResult) {
        let record = ExecutionRecord {
            function_id: request.function_id.clone(),
            owner_id: request.owner_id.clone(),
            status: result.status,
            output: result.output.clone(),
            error: result.error.clone(),
            elapsed_ms: result.elapsed_ms,
            created_at: Utc::now(),
        };
        if let Err(err) = self.log.append(record) {
            warn!(function_id = %request.function_id, error = %err, "failed to append execution log row");
        }
    }
}
