use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use opsconductor_core::ExecutionId;
use rusqlite::{Connection, TransactionBehavior};
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::store::{load_execution, lock_conn, write_execution, ScheduleStore};
use crate::types::{ExecutionStatus, ScheduleExecution};

/// Applies lifecycle reports to `schedule_executions` rows.
///
/// Every report names the state it expects the execution to be in; a report
/// that does not match is rejected with [`SchedulerError::InvalidTransition`]
/// and the row is left untouched.
#[derive(Clone)]
pub struct ExecutionTracker {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl ExecutionTracker {
    pub fn new(store: &ScheduleStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn: store.shared(),
            clock,
        }
    }

    /// Engine callback: the job started running.
    #[instrument(skip(self), fields(execution_id = %id))]
    pub fn report_started(&self, id: &ExecutionId) -> Result<ScheduleExecution> {
        self.transition(
            id,
            &[ExecutionStatus::Scheduled],
            ExecutionStatus::Running,
            |e, now| e.started_at = Some(now),
        )
    }

    /// Engine callback: the job finished successfully.
    #[instrument(skip(self, result_summary), fields(execution_id = %id))]
    pub fn report_completed(
        &self,
        id: &ExecutionId,
        result_summary: Option<String>,
    ) -> Result<ScheduleExecution> {
        self.transition(
            id,
            &[ExecutionStatus::Running],
            ExecutionStatus::Completed,
            |e, now| {
                e.completed_at = Some(finish_time(e.started_at, now));
                e.result_summary = result_summary;
            },
        )
    }

    /// Engine callback: the job ran and failed.
    #[instrument(skip(self, error), fields(execution_id = %id))]
    pub fn report_failed(&self, id: &ExecutionId, error: String) -> Result<ScheduleExecution> {
        self.transition(
            id,
            &[ExecutionStatus::Running],
            ExecutionStatus::Failed,
            |e, now| {
                e.completed_at = Some(finish_time(e.started_at, now));
                e.error_message = Some(error);
            },
        )
    }

    /// The handoff itself failed; the job never started.
    pub fn mark_handoff_failed(
        &self,
        id: &ExecutionId,
        cause: &SchedulerError,
    ) -> Result<ScheduleExecution> {
        let note = cause.note();
        self.transition(
            id,
            &[ExecutionStatus::Scheduled],
            ExecutionStatus::Failed,
            |e, now| {
                e.completed_at = Some(now);
                e.error_message = Some(note);
            },
        )
    }

    /// Never handed off: approval missing or schedule disabled meanwhile.
    pub fn mark_skipped(&self, id: &ExecutionId, reason: String) -> Result<ScheduleExecution> {
        self.transition(
            id,
            &[ExecutionStatus::Scheduled],
            ExecutionStatus::Skipped,
            |e, now| {
                e.completed_at = Some(now);
                e.error_message = Some(reason);
            },
        )
    }

    /// Record the engine's own reference once it accepted the request.
    /// Not a state change, so it is valid from any state.
    pub fn link_job_execution(
        &self,
        id: &ExecutionId,
        reference: String,
    ) -> Result<ScheduleExecution> {
        let now = self.clock.now();
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut execution = load_execution(&tx, id)?.ok_or_else(|| {
            SchedulerError::ExecutionNotFound { id: id.to_string() }
        })?;
        execution.job_execution_id = Some(reference);
        execution.updated_at = now;
        write_execution(&tx, &execution)?;
        tx.commit()?;
        Ok(execution)
    }

    fn transition<F>(
        &self,
        id: &ExecutionId,
        expected: &[ExecutionStatus],
        to: ExecutionStatus,
        apply: F,
    ) -> Result<ScheduleExecution>
    where
        F: FnOnce(&mut ScheduleExecution, DateTime<Utc>),
    {
        let now = self.clock.now();
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut execution = load_execution(&tx, id)?.ok_or_else(|| {
            SchedulerError::ExecutionNotFound { id: id.to_string() }
        })?;

        let from = execution.status;
        if !expected.contains(&from) || !from.can_transition_to(to) {
            warn!(execution_id = %id, %from, %to, "rejected execution report");
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        apply(&mut execution, now);
        execution.status = to;
        execution.updated_at = now;
        write_execution(&tx, &execution)?;
        tx.commit()?;

        info!(execution_id = %id, serial = %execution.serial, %from, %to, "execution updated");
        Ok(execution)
    }
}

/// `completed_at` never precedes `started_at`, whatever the reporter's clock says.
fn finish_time(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    started_at.map_or(now, |start| start.max(now))
}
