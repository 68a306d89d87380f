//! Least-privilege subprocess sandbox and HTTP response capture.
//!
//! [runner::ProcessSandbox] materializes user handler code into an ephemeral
//! scratch unit, executes it in an external interpreter launched with a
//! closed capability list, and enforces a hard wall-clock deadline.
//! [capture::capture_stdout] interprets the sandbox's stdout as either a
//! structured HTTP envelope or raw output.

pub mod capture;
pub mod runner;

pub use capture::{capture_stdout, CapturedResponse, HttpEnvelope, TRUNCATION_MARKER};
pub use runner::{
    InterpreterConfig, ProcessSandbox, SandboxError, SandboxLimits, SandboxOutcome, SandboxRunner,
};
