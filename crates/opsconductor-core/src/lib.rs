//! Shared building blocks for the OpsConductor workspace: configuration,
//! the core error type, and identifier/serial helpers.

pub mod config;
pub mod error;
pub mod types;

pub use config::OpsConfig;
pub use error::{CoreError, Result};
pub use types::{ExecutionId, JobId, ScheduleId};
