//! Engine configuration: compile-time defaults with environment overrides.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use fnhive_sandbox::runner::DEFAULT_MAX_OUTPUT_BYTES;
use fnhive_sandbox::InterpreterConfig;

pub const MAX_MACHINE_INSTANCES: usize = 50;
pub const MAX_USER_CONCURRENT: i64 = 10;
pub const MAX_USER_CPU_MS: i64 = 7_200_000;
pub const MAX_WALL_MS: u64 = 15_000;

/// Engine-wide ceilings and sandbox wiring.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Machine-wide ceiling on concurrently running sandboxes.
    pub max_machine_instances: usize,
    /// Per-user ceiling on concurrently running sandboxes.
    pub max_user_concurrent: i64,
    /// Per-user cumulative CPU-time budget between administrative resets.
    pub max_user_cpu_ms: i64,
    /// Hard wall-clock deadline per invocation.
    pub max_wall_ms: u64,
    /// Byte cap per captured stream and emitted payload.
    pub max_output_bytes: usize,
    pub interpreter: InterpreterConfig,
    pub scratch_dir: PathBuf,
    /// Zero all persisted `concurrent_count` rows at engine construction.
    /// A single-node restart means nothing is in flight, so nonzero counts
    /// are stale leaks from a crash.
    pub recover_concurrency_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_machine_instances: MAX_MACHINE_INSTANCES,
            max_user_concurrent: MAX_USER_CONCURRENT,
            max_user_cpu_ms: MAX_USER_CPU_MS,
            max_wall_ms: MAX_WALL_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            interpreter: InterpreterConfig::default(),
            scratch_dir: std::env::temp_dir().join("fnhive"),
            recover_concurrency_on_start: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FNHIVE_*` environment variables. Unparsable
    /// values fall back to the default with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut config = Self {
            max_machine_instances: env_parse(
                "FNHIVE_MAX_MACHINE_INSTANCES",
                defaults.max_machine_instances,
            ),
            max_user_concurrent: env_parse("FNHIVE_MAX_USER_CONCURRENT", defaults.max_user_concurrent),
            max_user_cpu_ms: env_parse("FNHIVE_MAX_USER_CPU_MS", defaults.max_user_cpu_ms),
            max_wall_ms: env_parse("FNHIVE_MAX_WALL_MS", defaults.max_wall_ms),
            ..defaults
        };
        if let Ok(program) = std::env::var("FNHIVE_INTERPRETER") {
            config.interpreter.program = program;
        }
        if let Ok(dir) = std::env::var("FNHIVE_SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(dir);
        }
        config
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, raw = %raw, "unparsable configuration value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
