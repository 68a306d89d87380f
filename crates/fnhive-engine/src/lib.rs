//! FaaS execution engine: admission control, sandboxed execution, quota
//! settlement, and audit logging.
//!
//! [Engine::execute] is the single entry point: it admits a request against
//! the machine and per-user ceilings, runs the user code in a
//! least-privilege sandbox under a hard deadline, settles CPU billing, logs
//! the invocation, and always releases its reservations.

pub mod admission;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;

pub use admission::{AdmissionController, AdmissionTicket, MachineSlots};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use models::{ExecutionRequest, ExecutionResult};
