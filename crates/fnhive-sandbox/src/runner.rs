//! Sandboxed execution of user handler code in an external interpreter.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capture::TRUNCATION_MARKER;

pub const DEFAULT_WALL_MS: u64 = 15_000;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_048_576;

/// Per-invocation resource caps.
#[derive(Clone, Debug)]
pub struct SandboxLimits {
    /// Hard wall-clock deadline; expiry forces termination with no grace.
    pub wall_ms: u64,
    /// Byte cap retained per captured stream.
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            wall_ms: DEFAULT_WALL_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// External interpreter invocation: the program plus the closed capability
/// list it is launched with. Every capability not granted here is denied;
/// a new grant must be added to `args` explicitly.
#[derive(Clone, Debug)]
pub struct InterpreterConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl InterpreterConfig {
    /// Deno with outbound network as the only grant: no filesystem, no
    /// environment, no subprocesses, no FFI.
    pub fn deno() -> Self {
        Self {
            program: "deno".to_string(),
            args: ["run", "--quiet", "--no-prompt", "--allow-net"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self::deno()
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start sandbox: {0}")]
    Spawn(String),
    #[error("sandbox I/O error: {0}")]
    Io(String),
}

/// Terminal state of one sandboxed run.
#[derive(Clone, Debug)]
pub enum SandboxOutcome {
    Completed {
        success: bool,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        stdout_so_far: String,
        stderr_so_far: String,
    },
}

/// Runner seam: execute one unit of user code under a deadline.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(
        &self,
        source_code: &str,
        input: Option<Value>,
        deadline_ms: u64,
    ) -> Result<SandboxOutcome, SandboxError>;
}

/// Subprocess-backed sandbox: materialize, spawn least-privilege, drain
/// pipes concurrently, enforce the deadline, dispose the scratch unit.
pub struct ProcessSandbox {
    interpreter: InterpreterConfig,
    limits: SandboxLimits,
    scratch_dir: PathBuf,
}

impl ProcessSandbox {
    pub fn new(
        interpreter: InterpreterConfig,
        limits: SandboxLimits,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interpreter,
            limits,
            scratch_dir: scratch_dir.into(),
        }
    }

    async fn run_unit(
        &self,
        unit_path: &Path,
        deadline_ms: u64,
    ) -> Result<SandboxOutcome, SandboxError> {
        let mut command = Command::new(resolve_program(&self.interpreter.program));
        command.args(&self.interpreter.args);
        command.arg(unit_path);
        // The child inherits nothing: no environment, no stdin, no
        // descriptors beyond the two capture pipes.
        command.env_clear();
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("stdout pipe missing".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn("stderr pipe missing".to_string()))?;

        // Drain both pipes while awaiting exit; reading after the child
        // blocks on a full pipe buffer would deadlock.
        let cap = self.limits.max_output_bytes;
        let stdout_task = tokio::spawn(drain_capped(stdout, cap));
        let stderr_task = tokio::spawn(drain_capped(stderr, cap));

        match timeout(Duration::from_millis(deadline_ms), child.wait()).await {
            Ok(status) => {
                let status = status.map_err(|e| SandboxError::Io(e.to_string()))?;
                let stdout = finish_stream(stdout_task.await)?;
                let stderr = finish_stream(stderr_task.await)?;
                debug!(success = status.success(), "sandbox completed");
                Ok(SandboxOutcome::Completed {
                    success: status.success(),
                    exit_code: status.code(),
                    stdout,
                    stderr,
                })
            }
            Err(_) => {
                // Hard kill, then reap so no zombie outlives the handle.
                if let Err(err) = child.start_kill() {
                    warn!(error = %err, "failed to kill timed-out sandbox child");
                }
                let _ = child.wait().await;
                let stdout_so_far = finish_stream(stdout_task.await)?;
                let stderr_so_far = finish_stream(stderr_task.await)?;
                debug!(deadline_ms, "sandbox deadline expired");
                Ok(SandboxOutcome::TimedOut {
                    stdout_so_far,
                    stderr_so_far,
                })
            }
        }
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandbox {
    async fn run(
        &self,
        source_code: &str,
        input: Option<Value>,
        deadline_ms: u64,
    ) -> Result<SandboxOutcome, SandboxError> {
        std::fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| SandboxError::Io(format!("create scratch dir: {e}")))?;
        let unit_path = self.scratch_dir.join(format!("{}.js", Uuid::new_v4()));
        std::fs::write(&unit_path, materialize_unit(source_code, input.as_ref()))
            .map_err(|e| SandboxError::Io(format!("write scratch unit: {e}")))?;

        let outcome = self.run_unit(&unit_path, deadline_ms).await;

        // The scratch unit is disposed on every exit path; a failed removal
        // is logged and swallowed.
        if let Err(err) = std::fs::remove_file(&unit_path) {
            warn!(path = %unit_path.display(), error = %err, "failed to remove scratch unit");
        }
        outcome
    }
}

/// Build the ephemeral unit: bind `input`, embed the user source verbatim as
/// an async handler body, and marshal a returned `Response` into one stdout
/// line carrying the `{status, headers, body}` envelope.
fn materialize_unit(source_code: &str, input: Option<&Value>) -> String {
    let bound = match input {
        Some(value) => value.to_string(),
        None => "undefined".to_string(),
    };
    format!(
        "const input = {bound};\n\
         const __handler = async () => {{\n\
         {source_code}\n\
         }};\n\
         const __result = await __handler();\n\
         if (__result instanceof Response) {{\n\
             const headers = {{}};\n\
             for (const [name, value] of __result.headers) headers[name] = value;\n\
             const body = await __result.text();\n\
             console.log(JSON.stringify({{ status: __result.status, headers, body }}));\n\
         }} else if (__result !== undefined) {{\n\
             console.log(JSON.stringify(__result));\n\
         }}\n"
    )
}

/// Resolve a bare program name against the parent's PATH. The child's
/// environment is cleared before exec, so lookup must happen here.
fn resolve_program(program: &str) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    std::env::split_paths(&std::env::var_os("PATH").unwrap_or_default())
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(program))
}

/// Read a pipe to EOF, retaining at most `cap` bytes. Draining never stops
/// early: a capped stream keeps consuming so the child never blocks on a
/// full pipe buffer.
async fn drain_capped<R>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; 8192];
    let mut retained = Vec::new();
    let mut overflowed = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if retained.len() < cap {
            let take = (cap - retained.len()).min(n);
            retained.extend_from_slice(&chunk[..take]);
            if take < n {
                overflowed = true;
            }
        } else {
            overflowed = true;
        }
    }
    Ok((retained, overflowed))
}

fn finish_stream(
    joined: Result<std::io::Result<(Vec<u8>, bool)>, tokio::task::JoinError>,
) -> Result<String, SandboxError> {
    let (bytes, overflowed) = joined
        .map_err(|e| SandboxError::Io(format!("stream reader task: {e}")))?
        .map_err(|e| SandboxError::Io(format!("stream read: {e}")))?;
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if overflowed {
        text.push_str(TRUNCATION_MARKER);
    }
    Ok(text)
}
