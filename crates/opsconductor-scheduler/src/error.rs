use thiserror::Error;

use crate::types::ExecutionStatus;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Rejected at create/update time: mutually exclusive fields, bad cron,
    /// unknown timezone, inverted validity window.
    #[error("Invalid schedule config: {0}")]
    InvalidScheduleConfig(String),

    /// A stored schedule could not be evaluated at dispatch time.
    #[error("Trigger computation failed: {0}")]
    TriggerComputation(String),

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// An engine report arrived for an execution not in the expected state.
    #[error("Invalid transition for execution {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Handoff timed out after {ms}ms")]
    HandoffTimeout { ms: u64 },

    #[error("Handoff rejected: {0}")]
    HandoffRejected(String),

    /// Transport or protocol failure talking to the execution engine.
    #[error("Execution engine error: {0}")]
    Engine(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Stable code stored alongside human-readable error notes.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::InvalidScheduleConfig(_) => "INVALID_SCHEDULE_CONFIG",
            SchedulerError::TriggerComputation(_) => "TRIGGER_COMPUTATION_ERROR",
            SchedulerError::ScheduleNotFound { .. } => "SCHEDULE_NOT_FOUND",
            SchedulerError::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::HandoffTimeout { .. } => "HANDOFF_TIMEOUT",
            SchedulerError::HandoffRejected(_) => "HANDOFF_REJECTED",
            SchedulerError::Engine(_) => "ENGINE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// `CODE: message`, the form persisted in `last_error` / `error_message`.
    pub fn note(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
