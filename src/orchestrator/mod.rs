//! Session orchestration.
//!
//! - `registry`: in-memory session state, the single source of truth.
//! - `spawner`: command construction with environment isolation.
//! - `supervisor`: spawn, cancel and reap session processes.
//! - `output`: pull-based decoded output stream.
//! - `resolver`: executable lookup seam.
//! - `service`: the [`Orchestrator`] facade.

pub mod output;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod spawner;
pub mod supervisor;

pub use output::OutputStream;
pub use registry::{SessionFilter, SessionRegistry};
pub use resolver::{BinaryResolver, ResolvedBinary, StaticBinaryResolver};
pub use service::{Orchestrator, OrchestratorOptions, SessionRequest};
pub use spawner::SpawnRequest;
pub use supervisor::{ProcessSupervisor, SupervisorConfig};
