#![forbid(unsafe_code)]

//! Supervise interactive agent CLI sessions and checkpoint the working
//! trees they mutate into a content-addressed, branchable timeline.

pub mod cas;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod stream;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use orchestrator::Orchestrator;
