use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use opsconductor_core::types::SCHEDULE_SERIAL_PREFIX;
use opsconductor_core::{ExecutionId, JobId, ScheduleId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{info, instrument};

use crate::db::{conversion_err, init_db, next_serial, opt_ts, parse_opt_ts, parse_ts, ts};
use crate::error::{Result, SchedulerError};
use crate::schedule::validate_config;
use crate::types::{
    ExecutionStatus, JobSchedule, NewSchedule, ScheduleExecution, ScheduleRule, ScheduleStatus,
    ScheduleUpdate,
};

const SCHEDULE_COLUMNS: &str = "id, serial, job_id, name, description, schedule_type,
    cron_expression, interval_seconds, timezone, start_date, end_date, is_active, status,
    current_runs, max_runs, next_run_at, last_run_at, last_error, created_by,
    created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, serial, schedule_id, job_id, job_execution_id,
    scheduled_at, started_at, completed_at, status, result_summary, error_message,
    context, created_at, updated_at";

/// A schedule that was due when the scan ran. The dispatch loop re-checks
/// it under lock before acting.
#[derive(Debug, Clone, PartialEq)]
pub struct DueSchedule {
    pub id: ScheduleId,
    pub job_id: JobId,
    pub next_run_at: DateTime<Utc>,
}

/// Repository over `job_schedules` and `schedule_executions`.
///
/// Cheap to clone; clones share one connection. Run one store (one
/// connection) per dispatcher instance: cross-instance serialisation comes
/// from SQLite's write lock, not from this mutex.
#[derive(Clone)]
pub struct ScheduleStore {
    conn: Arc<Mutex<Connection>>,
}

impl ScheduleStore {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_conn(&self.conn)
    }

    /// Validate and persist a new schedule, computing its first `next_run_at`.
    #[instrument(skip(self, new), fields(job_id = %new.job_id, name = %new.name))]
    pub fn create_schedule(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<JobSchedule> {
        validate_config(
            &new.rule,
            &new.timezone,
            new.start_date,
            new.end_date,
            new.max_runs,
            now,
        )?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let serial = next_serial(&tx, SCHEDULE_SERIAL_PREFIX)?;

        let mut schedule = JobSchedule {
            id: ScheduleId::new(),
            serial,
            job_id: new.job_id,
            name: new.name,
            description: new.description,
            rule: new.rule,
            timezone: new.timezone,
            start_date: new.start_date,
            end_date: new.end_date,
            is_active: true,
            status: if new.start_paused {
                ScheduleStatus::Paused
            } else {
                ScheduleStatus::Active
            },
            current_runs: 0,
            max_runs: new.max_runs,
            next_run_at: None,
            last_run_at: None,
            last_error: None,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        reconcile_next_run(&mut schedule, now)?;

        tx.execute(
            &format!(
                "INSERT INTO job_schedules ({SCHEDULE_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)"
            ),
            params![
                schedule.id.to_string(),
                schedule.serial,
                schedule.job_id.to_string(),
                schedule.name,
                schedule.description,
                schedule.rule.kind(),
                schedule.rule.cron_expression(),
                schedule.rule.interval_seconds().map(|s| s as i64),
                schedule.timezone,
                opt_ts(&schedule.start_date),
                opt_ts(&schedule.end_date),
                schedule.is_active,
                schedule.status.as_str(),
                schedule.current_runs,
                schedule.max_runs,
                opt_ts(&schedule.next_run_at),
                opt_ts(&schedule.last_run_at),
                schedule.last_error,
                schedule.created_by,
                ts(&schedule.created_at),
                ts(&schedule.updated_at),
            ],
        )?;
        tx.commit()?;

        info!(
            schedule_id = %schedule.id,
            serial = %schedule.serial,
            kind = schedule.rule.kind(),
            next_run_at = ?schedule.next_run_at,
            "schedule created"
        );
        Ok(schedule)
    }

    pub fn get_schedule(&self, id: &ScheduleId) -> Result<JobSchedule> {
        let conn = self.lock()?;
        load_schedule(&conn, id)?.ok_or_else(|| SchedulerError::ScheduleNotFound {
            id: id.to_string(),
        })
    }

    /// All schedules ordered by serial, optionally filtered by status.
    pub fn list_schedules(&self, status: Option<ScheduleStatus>) -> Result<Vec<JobSchedule>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM job_schedules
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY serial"
        ))?;
        let rows = stmt.query_map([status.map(|s| s.as_str())], row_to_schedule)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Apply a configuration change. Timing changes recompute `next_run_at`,
    /// which may expire an active schedule or revive an expired one.
    #[instrument(skip(self, update), fields(schedule_id = %id))]
    pub fn update_schedule(
        &self,
        id: &ScheduleId,
        update: ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<JobSchedule> {
        self.modify(id, |s| {
            let timing_changed = update.rule.is_some()
                || update.timezone.is_some()
                || update.start_date.is_some()
                || update.end_date.is_some()
                || update.max_runs.is_some();

            if let Some(name) = update.name {
                s.name = name;
            }
            if let Some(description) = update.description {
                s.description = description;
            }
            if let Some(rule) = update.rule {
                s.rule = rule;
            }
            if let Some(tz) = update.timezone {
                s.timezone = tz;
            }
            if let Some(start) = update.start_date {
                s.start_date = start;
            }
            if let Some(end) = update.end_date {
                s.end_date = end;
            }
            if let Some(max) = update.max_runs {
                if max.is_some_and(|m| m < s.current_runs) {
                    return Err(SchedulerError::InvalidScheduleConfig(format!(
                        "max_runs {} is below current_runs {}",
                        max.unwrap_or_default(),
                        s.current_runs
                    )));
                }
                s.max_runs = max;
            }

            validate_config(&s.rule, &s.timezone, s.start_date, s.end_date, s.max_runs, now)?;
            if timing_changed {
                if s.status == ScheduleStatus::Expired {
                    s.status = ScheduleStatus::Active;
                }
                reconcile_next_run(s, now)?;
            }
            s.updated_at = now;
            Ok(())
        })
    }

    /// Stop firing until resumed. Clears `next_run_at`.
    pub fn pause(&self, id: &ScheduleId, now: DateTime<Utc>) -> Result<JobSchedule> {
        let schedule = self.modify(id, |s| {
            if s.status == ScheduleStatus::Active {
                s.status = ScheduleStatus::Paused;
            }
            s.next_run_at = None;
            s.updated_at = now;
            Ok(())
        })?;
        info!(schedule_id = %id, status = %schedule.status, "schedule paused");
        Ok(schedule)
    }

    /// Re-enable a paused or disabled schedule. Slots missed meanwhile are
    /// not replayed; the next fire is computed from `now`.
    pub fn resume(&self, id: &ScheduleId, now: DateTime<Utc>) -> Result<JobSchedule> {
        let schedule = self.modify(id, |s| {
            if s.status == ScheduleStatus::Expired {
                return Ok(());
            }
            s.status = ScheduleStatus::Active;
            s.is_active = true;
            s.last_error = None;
            reconcile_next_run(s, now)?;
            s.updated_at = now;
            Ok(())
        })?;
        info!(
            schedule_id = %id,
            status = %schedule.status,
            next_run_at = ?schedule.next_run_at,
            "schedule resumed"
        );
        Ok(schedule)
    }

    /// Operator disable. Takes effect on the next dispatch tick.
    pub fn disable(
        &self,
        id: &ScheduleId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobSchedule> {
        let schedule = self.modify(id, |s| {
            s.status = ScheduleStatus::Disabled;
            s.is_active = false;
            s.next_run_at = None;
            if reason.is_some() {
                s.last_error = reason;
            }
            s.updated_at = now;
            Ok(())
        })?;
        info!(schedule_id = %id, "schedule disabled");
        Ok(schedule)
    }

    /// Delete a schedule and, by cascade, its execution history.
    pub fn delete_schedule(&self, id: &ScheduleId) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM job_schedules WHERE id = ?1",
            [id.to_string()],
        )?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    /// Enabled schedules whose `next_run_at` has arrived, oldest slot first.
    pub fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DueSchedule>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, job_id, next_run_at FROM job_schedules
             WHERE status = 'active' AND is_active = 1
               AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![ts(&now), limit as i64], |row| {
            Ok(DueSchedule {
                id: row
                    .get::<_, String>(0)?
                    .parse()
                    .map_err(|e| conversion_err(0, e))?,
                job_id: row
                    .get::<_, String>(1)?
                    .parse()
                    .map_err(|e| conversion_err(1, e))?,
                next_run_at: parse_ts(2, &row.get::<_, String>(2)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Result<ScheduleExecution> {
        let conn = self.lock()?;
        load_execution(&conn, id)?.ok_or_else(|| SchedulerError::ExecutionNotFound {
            id: id.to_string(),
        })
    }

    /// Execution history of one schedule, newest slot first.
    pub fn list_executions(
        &self,
        schedule_id: &ScheduleId,
        limit: usize,
    ) -> Result<Vec<ScheduleExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM schedule_executions
             WHERE schedule_id = ?1
             ORDER BY scheduled_at DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![schedule_id.to_string(), limit as i64],
            row_to_execution,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// `scheduled` executions never accepted by the engine and created
    /// before `before`: left behind by a crash between commit and handoff.
    pub fn stranded_executions(&self, before: DateTime<Utc>) -> Result<Vec<ScheduleExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM schedule_executions
             WHERE status = 'scheduled' AND job_execution_id IS NULL AND created_at < ?1
             ORDER BY scheduled_at"
        ))?;
        let rows = stmt.query_map([ts(&before)], row_to_execution)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Load, mutate and write back one schedule inside a write transaction.
    fn modify<F>(&self, id: &ScheduleId, f: F) -> Result<JobSchedule>
    where
        F: FnOnce(&mut JobSchedule) -> Result<()>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut schedule = load_schedule(&tx, id)?.ok_or_else(|| {
            SchedulerError::ScheduleNotFound { id: id.to_string() }
        })?;
        f(&mut schedule)?;
        write_schedule(&tx, &schedule)?;
        tx.commit()?;
        Ok(schedule)
    }
}

pub(crate) fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| SchedulerError::Internal("scheduler connection mutex poisoned".into()))
}

/// Bring `next_run_at` and `status` in line with the schedule's rule.
///
/// Not-enabled schedules get no `next_run_at`. An enabled schedule with no
/// future occurrence becomes `expired`.
pub(crate) fn reconcile_next_run(s: &mut JobSchedule, now: DateTime<Utc>) -> Result<()> {
    if !s.is_enabled() {
        s.next_run_at = None;
        return Ok(());
    }
    s.next_run_at = s.next_fire(now)?;
    if s.next_run_at.is_none() {
        s.status = ScheduleStatus::Expired;
    }
    Ok(())
}

pub(crate) fn load_schedule(conn: &Connection, id: &ScheduleId) -> Result<Option<JobSchedule>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM job_schedules WHERE id = ?1"),
            [id.to_string()],
            row_to_schedule,
        )
        .optional()?)
}

/// Persist every mutable column of `s`. Identity, serial and rule type are
/// written too so an update can switch between rule kinds.
pub(crate) fn write_schedule(conn: &Connection, s: &JobSchedule) -> Result<()> {
    conn.execute(
        "UPDATE job_schedules SET
            name = ?2, description = ?3, schedule_type = ?4, cron_expression = ?5,
            interval_seconds = ?6, timezone = ?7, start_date = ?8, end_date = ?9,
            is_active = ?10, status = ?11, current_runs = ?12, max_runs = ?13,
            next_run_at = ?14, last_run_at = ?15, last_error = ?16, updated_at = ?17
         WHERE id = ?1",
        params![
            s.id.to_string(),
            s.name,
            s.description,
            s.rule.kind(),
            s.rule.cron_expression(),
            s.rule.interval_seconds().map(|v| v as i64),
            s.timezone,
            opt_ts(&s.start_date),
            opt_ts(&s.end_date),
            s.is_active,
            s.status.as_str(),
            s.current_runs,
            s.max_runs,
            opt_ts(&s.next_run_at),
            opt_ts(&s.last_run_at),
            s.last_error,
            ts(&s.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn load_execution(
    conn: &Connection,
    id: &ExecutionId,
) -> Result<Option<ScheduleExecution>> {
    Ok(conn
        .query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM schedule_executions WHERE id = ?1"),
            [id.to_string()],
            row_to_execution,
        )
        .optional()?)
}

pub(crate) fn insert_execution(conn: &Connection, e: &ScheduleExecution) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO schedule_executions ({EXECUTION_COLUMNS})
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"
        ),
        params![
            e.id.to_string(),
            e.serial,
            e.schedule_id.to_string(),
            e.job_id.to_string(),
            e.job_execution_id,
            ts(&e.scheduled_at),
            opt_ts(&e.started_at),
            opt_ts(&e.completed_at),
            e.status.as_str(),
            e.result_summary,
            e.error_message,
            serde_json::to_string(&e.context)?,
            ts(&e.created_at),
            ts(&e.updated_at),
        ],
    )?;
    Ok(())
}

/// Persist the engine-facing fields of an execution.
pub(crate) fn write_execution(conn: &Connection, e: &ScheduleExecution) -> Result<()> {
    conn.execute(
        "UPDATE schedule_executions SET
            job_execution_id = ?2, started_at = ?3, completed_at = ?4, status = ?5,
            result_summary = ?6, error_message = ?7, updated_at = ?8
         WHERE id = ?1",
        params![
            e.id.to_string(),
            e.job_execution_id,
            opt_ts(&e.started_at),
            opt_ts(&e.completed_at),
            e.status.as_str(),
            e.result_summary,
            e.error_message,
            ts(&e.updated_at),
        ],
    )?;
    Ok(())
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobSchedule> {
    let rule = ScheduleRule::from_columns(
        &row.get::<_, String>(5)?,
        row.get(6)?,
        row.get(7)?,
    )
    .map_err(|e| conversion_err(5, e))?;
    let status: ScheduleStatus = row
        .get::<_, String>(12)?
        .parse()
        .map_err(|e: String| conversion_err(12, e))?;

    Ok(JobSchedule {
        id: row.get::<_, String>(0)?.parse().map_err(|e| conversion_err(0, e))?,
        serial: row.get(1)?,
        job_id: row.get::<_, String>(2)?.parse().map_err(|e| conversion_err(2, e))?,
        name: row.get(3)?,
        description: row.get(4)?,
        rule,
        timezone: row.get(8)?,
        start_date: parse_opt_ts(9, row.get(9)?)?,
        end_date: parse_opt_ts(10, row.get(10)?)?,
        is_active: row.get(11)?,
        status,
        current_runs: row.get(13)?,
        max_runs: row.get(14)?,
        next_run_at: parse_opt_ts(15, row.get(15)?)?,
        last_run_at: parse_opt_ts(16, row.get(16)?)?,
        last_error: row.get(17)?,
        created_by: row.get(18)?,
        created_at: parse_ts(19, &row.get::<_, String>(19)?)?,
        updated_at: parse_ts(20, &row.get::<_, String>(20)?)?,
    })
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleExecution> {
    let status: ExecutionStatus = row
        .get::<_, String>(8)?
        .parse()
        .map_err(|e: String| conversion_err(8, e))?;
    let context: serde_json::Value =
        serde_json::from_str(&row.get::<_, String>(11)?).map_err(|e| conversion_err(11, e))?;

    Ok(ScheduleExecution {
        id: row.get::<_, String>(0)?.parse().map_err(|e| conversion_err(0, e))?,
        serial: row.get(1)?,
        schedule_id: row.get::<_, String>(2)?.parse().map_err(|e| conversion_err(2, e))?,
        job_id: row.get::<_, String>(3)?.parse().map_err(|e| conversion_err(3, e))?,
        job_execution_id: row.get(4)?,
        scheduled_at: parse_ts(5, &row.get::<_, String>(5)?)?,
        started_at: parse_opt_ts(6, row.get(6)?)?,
        completed_at: parse_opt_ts(7, row.get(7)?)?,
        status,
        result_summary: row.get(9)?,
        error_message: row.get(10)?,
        context,
        created_at: parse_ts(12, &row.get::<_, String>(12)?)?,
        updated_at: parse_ts(13, &row.get::<_, String>(13)?)?,
    })
}
