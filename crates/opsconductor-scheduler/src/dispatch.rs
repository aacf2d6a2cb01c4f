//! Dispatch loop: turns due schedules into execution records and hands them
//! to the execution engine.
//!
//! Each due slot is claimed inside one `IMMEDIATE` transaction that
//! re-checks the schedule, inserts the execution, bumps `current_runs` and
//! stores the recomputed `next_run_at`. A second dispatcher racing for the
//! same slot blocks on the write lock and then finds the slot gone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opsconductor_core::config::SchedulerConfig;
use opsconductor_core::types::EXECUTION_SERIAL_PREFIX;
use opsconductor_core::{ExecutionId, ScheduleId};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::approval::{ApprovalGate, ApprovalStore, GateDecision};
use crate::catalog::{Job, JobCatalog};
use crate::clock::Clock;
use crate::db::next_serial;
use crate::engine::{ExecutionEngine, ExecutionRequest, SubmitOutcome};
use crate::error::{Result, SchedulerError};
use crate::store::{insert_execution, load_schedule, write_schedule, DueSchedule, ScheduleStore};
use crate::tracker::ExecutionTracker;
use crate::types::{ExecutionStatus, JobSchedule, ScheduleExecution, ScheduleStatus};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub tick_interval: Duration,
    /// Upper bound on one `submit` call.
    pub handoff_timeout: Duration,
    pub max_due_per_tick: usize,
    /// Re-handle executions stranded by a crash before the first tick.
    pub recover_on_startup: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for DispatchSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(cfg.tick_interval_secs.max(1)),
            handoff_timeout: Duration::from_millis(cfg.handoff_timeout_ms.max(1)),
            max_due_per_tick: cfg.max_due_per_tick.max(1),
            recover_on_startup: cfg.recover_on_startup,
        }
    }
}

/// Counters for one pass over the due schedules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub created: usize,
    pub skipped: usize,
    pub handed_off: usize,
    pub handoff_failed: usize,
    pub errors: usize,
}

/// What the dispatcher decided about a due slot before claiming it.
enum Verdict {
    Fire(Job),
    Skip(String),
}

pub(crate) enum ClaimOutcome {
    Claimed {
        execution: ScheduleExecution,
        schedule: JobSchedule,
    },
    /// Another tick (or instance) got there first, or the schedule changed.
    Stale,
    /// The schedule could not be evaluated any more and was disabled.
    Disabled { note: String },
}

enum Handoff {
    Accepted,
    Failed,
    Skipped,
}

pub struct Dispatcher {
    store: ScheduleStore,
    tracker: ExecutionTracker,
    catalog: Arc<dyn JobCatalog>,
    gate: ApprovalGate,
    engine: Arc<dyn ExecutionEngine>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: ScheduleStore,
        catalog: Arc<dyn JobCatalog>,
        approvals: Arc<dyn ApprovalStore>,
        engine: Arc<dyn ExecutionEngine>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        let tracker = ExecutionTracker::new(&store, Arc::clone(&clock));
        Self {
            store,
            tracker,
            catalog,
            gate: ApprovalGate::new(approvals),
            engine,
            clock,
            settings,
        }
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    /// Tracker sharing this dispatcher's connection and clock, for engine
    /// callbacks.
    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    /// Main loop. Ticks every `tick_interval` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            engine = self.engine.name(),
            tick_secs = self.settings.tick_interval.as_secs(),
            "dispatch loop started"
        );

        if self.settings.recover_on_startup {
            match self.recover_stranded().await {
                Ok(n) if n > 0 => warn!(count = n, "stranded executions recovered on startup"),
                Err(e) => error!("startup recovery failed: {e}"),
                _ => {}
            }
        }

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        // A slow tick must not be followed by a burst of catch-up ticks.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(code = e.code(), "dispatch tick error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatch loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: claim every due slot, then hand the claimed executions off.
    /// A failure on one schedule is counted and logged, never propagated.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let due = self.store.due_schedules(now, self.settings.max_due_per_tick)?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        for slot in &due {
            if let Err(e) = self.dispatch_one(slot, now, &mut report).await {
                report.errors += 1;
                error!(schedule_id = %slot.id, code = e.code(), "dispatch failed: {e}");
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                created = report.created,
                skipped = report.skipped,
                handed_off = report.handed_off,
                handoff_failed = report.handoff_failed,
                errors = report.errors,
                "dispatch tick complete"
            );
        }
        Ok(report)
    }

    /// Find `scheduled` executions that never reached the engine and finish
    /// the job: hand them off, or skip them if their schedule or job is gone.
    pub async fn recover_stranded(&self) -> Result<usize> {
        let stranded = self.store.stranded_executions(self.clock.now())?;
        let mut recovered = 0;
        for execution in &stranded {
            match self.recover_one(execution).await {
                Ok(()) => recovered += 1,
                Err(e) => warn!(execution_id = %execution.id, "recovery failed: {e}"),
            }
        }
        Ok(recovered)
    }

    async fn recover_one(&self, execution: &ScheduleExecution) -> Result<()> {
        match self.catalog.fetch_job(&execution.job_id).await? {
            Some(job) => {
                self.hand_off(execution, &job).await?;
            }
            None => {
                let missing = SchedulerError::JobNotFound {
                    id: execution.job_id.to_string(),
                };
                self.tracker.mark_skipped(&execution.id, missing.note())?;
            }
        }
        Ok(())
    }

    async fn dispatch_one(
        &self,
        due: &DueSchedule,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let verdict = match self.catalog.fetch_job(&due.job_id).await? {
            None => Verdict::Skip(
                SchedulerError::JobNotFound {
                    id: due.job_id.to_string(),
                }
                .note(),
            ),
            Some(job) => match self.gate.check(&job).await? {
                GateDecision::Open => Verdict::Fire(job),
                GateDecision::Blocked { reason } => Verdict::Skip(reason),
            },
        };
        let skip_reason = match &verdict {
            Verdict::Skip(reason) => Some(reason.as_str()),
            Verdict::Fire(_) => None,
        };

        let outcome = {
            let mut conn = self.store.lock()?;
            claim_slot(&mut conn, &due.id, due.next_run_at, now, skip_reason)?
        };

        let (execution, schedule) = match outcome {
            ClaimOutcome::Claimed {
                execution,
                schedule,
            } => (execution, schedule),
            ClaimOutcome::Stale => {
                debug!(schedule_id = %due.id, slot = %due.next_run_at, "slot already claimed");
                return Ok(());
            }
            ClaimOutcome::Disabled { note } => {
                report.errors += 1;
                error!(schedule_id = %due.id, %note, "schedule disabled");
                return Ok(());
            }
        };
        report.created += 1;
        info!(
            schedule_id = %schedule.id,
            execution_id = %execution.id,
            serial = %execution.serial,
            scheduled_at = %execution.scheduled_at,
            status = %execution.status,
            next_run_at = ?schedule.next_run_at,
            "execution created"
        );

        match verdict {
            Verdict::Skip(reason) => {
                report.skipped += 1;
                info!(execution_id = %execution.id, %reason, "execution skipped");
            }
            Verdict::Fire(job) => match self.hand_off(&execution, &job).await? {
                Handoff::Accepted => report.handed_off += 1,
                Handoff::Failed => report.handoff_failed += 1,
                Handoff::Skipped => report.skipped += 1,
            },
        }
        Ok(())
    }

    /// Submit one `scheduled` execution, bounded by `handoff_timeout`.
    async fn hand_off(&self, execution: &ScheduleExecution, job: &Job) -> Result<Handoff> {
        let schedule = self.store.get_schedule(&execution.schedule_id)?;
        if !schedule.is_active
            || matches!(schedule.status, ScheduleStatus::Paused | ScheduleStatus::Disabled)
        {
            self.tracker
                .mark_skipped(&execution.id, "schedule disabled before handoff".into())?;
            return Ok(Handoff::Skipped);
        }

        let request = ExecutionRequest {
            execution_id: execution.id,
            execution_serial: execution.serial.clone(),
            schedule_id: execution.schedule_id,
            job_id: job.id,
            scheduled_at: execution.scheduled_at,
            targets: job.targets.clone(),
            action_config: job.action_config.clone(),
            timeout_secs: job.timeout_secs,
            max_retries: job.max_retries,
            retry_delay_secs: job.retry_delay_secs,
        };

        let limit = self.settings.handoff_timeout;
        let cause = match tokio::time::timeout(limit, self.engine.submit(&request)).await {
            Ok(Ok(SubmitOutcome::Accepted { reference })) => {
                let reference = reference.unwrap_or_else(|| execution.id.to_string());
                self.tracker
                    .link_job_execution(&execution.id, reference.clone())?;
                info!(
                    execution_id = %execution.id,
                    engine = self.engine.name(),
                    %reference,
                    "execution handed off"
                );
                return Ok(Handoff::Accepted);
            }
            Ok(Ok(SubmitOutcome::Rejected { reason })) => SchedulerError::HandoffRejected(reason),
            Ok(Err(e)) => e,
            Err(_) => SchedulerError::HandoffTimeout {
                ms: limit.as_millis() as u64,
            },
        };

        warn!(execution_id = %execution.id, code = cause.code(), "handoff failed: {cause}");
        self.tracker.mark_handoff_failed(&execution.id, &cause)?;
        Ok(Handoff::Failed)
    }
}

/// Claim `slot` for schedule `id` in one write transaction.
///
/// The schedule must still be enabled with `next_run_at == slot <= now`.
/// On success the execution row exists (as `scheduled`, or `skipped` when
/// `skip_reason` is given), `current_runs` and `last_run_at` have advanced
/// and `next_run_at` holds the following slot, or the schedule is `expired`.
pub(crate) fn claim_slot(
    conn: &mut Connection,
    id: &ScheduleId,
    slot: DateTime<Utc>,
    now: DateTime<Utc>,
    skip_reason: Option<&str>,
) -> Result<ClaimOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let Some(mut schedule) = load_schedule(&tx, id)? else {
        return Ok(ClaimOutcome::Stale);
    };
    if !schedule.is_enabled() || schedule.next_run_at != Some(slot) || slot > now {
        return Ok(ClaimOutcome::Stale);
    }

    let mut advanced = schedule.clone();
    advanced.current_runs += 1;
    advanced.last_run_at = Some(slot);
    advanced.updated_at = now;
    match advanced.next_fire(now) {
        Ok(next) => {
            advanced.next_run_at = next;
            if next.is_none() {
                advanced.status = ScheduleStatus::Expired;
                info!(
                    schedule_id = %id,
                    max_runs_reached = advanced.runs_exhausted(),
                    "schedule expired"
                );
            }
        }
        Err(e) => {
            // The slot stays unconsumed; an operator has to fix and resume.
            let note = e.note();
            schedule.status = ScheduleStatus::Disabled;
            schedule.is_active = false;
            schedule.next_run_at = None;
            schedule.last_error = Some(note.clone());
            schedule.updated_at = now;
            write_schedule(&tx, &schedule)?;
            tx.commit()?;
            return Ok(ClaimOutcome::Disabled { note });
        }
    }

    let (status, completed_at, error_message) = match skip_reason {
        Some(reason) => (ExecutionStatus::Skipped, Some(now), Some(reason.to_string())),
        None => (ExecutionStatus::Scheduled, None, None),
    };
    let execution = ScheduleExecution {
        id: ExecutionId::new(),
        serial: next_serial(&tx, EXECUTION_SERIAL_PREFIX)?,
        schedule_id: schedule.id,
        job_id: schedule.job_id,
        job_execution_id: None,
        scheduled_at: slot,
        started_at: None,
        completed_at,
        status,
        result_summary: None,
        error_message,
        context: serde_json::json!({
            "schedule_serial": schedule.serial,
            "schedule_type": schedule.rule.kind(),
            "run": advanced.current_runs,
        }),
        created_at: now,
        updated_at: now,
    };
    insert_execution(&tx, &execution)?;
    write_schedule(&tx, &advanced)?;
    tx.commit()?;

    Ok(ClaimOutcome::Claimed {
        execution,
        schedule: advanced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Barrier, Mutex};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use opsconductor_core::JobId;

    use crate::approval::{ApprovalRecord, ApprovalStatus, InMemoryApprovalStore};
    use crate::catalog::SqliteJobCatalog;
    use crate::clock::ManualClock;
    use crate::types::{NewSchedule, ScheduleRule};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// Accepts everything and remembers what it was given.
    #[derive(Default)]
    struct RecordingEngine {
        submitted: Mutex<Vec<ExecutionRequest>>,
    }

    impl RecordingEngine {
        fn count(&self) -> usize {
            self.submitted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ExecutionEngine for RecordingEngine {
        fn name(&self) -> &str {
            "recording"
        }

        async fn submit(&self, request: &ExecutionRequest) -> Result<SubmitOutcome> {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(request.clone());
            Ok(SubmitOutcome::Accepted {
                reference: Some(format!("JEX-{}", submitted.len())),
            })
        }
    }

    struct RejectingEngine;

    #[async_trait]
    impl ExecutionEngine for RejectingEngine {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn submit(&self, _request: &ExecutionRequest) -> Result<SubmitOutcome> {
            Ok(SubmitOutcome::Rejected {
                reason: "no capacity".into(),
            })
        }
    }

    /// Never answers.
    struct HangingEngine;

    #[async_trait]
    impl ExecutionEngine for HangingEngine {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn submit(&self, _request: &ExecutionRequest) -> Result<SubmitOutcome> {
            std::future::pending().await
        }
    }

    struct Harness {
        store: ScheduleStore,
        clock: Arc<ManualClock>,
        catalog: Arc<SqliteJobCatalog>,
        approvals: Arc<InMemoryApprovalStore>,
    }

    impl Harness {
        fn new(store: ScheduleStore) -> Self {
            Self {
                catalog: Arc::new(SqliteJobCatalog::new(&store)),
                store,
                clock: Arc::new(ManualClock::new(at("2025-01-01T00:00:00Z"))),
                approvals: Arc::new(InMemoryApprovalStore::new()),
            }
        }

        fn in_memory() -> Self {
            Self::new(ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap())
        }

        fn dispatcher(&self, engine: Arc<dyn ExecutionEngine>) -> Dispatcher {
            Dispatcher::new(
                self.store.clone(),
                self.catalog.clone(),
                self.approvals.clone(),
                engine,
                self.clock.clone(),
                DispatchSettings {
                    tick_interval: Duration::from_secs(1),
                    handoff_timeout: Duration::from_millis(50),
                    max_due_per_tick: 100,
                    recover_on_startup: true,
                },
            )
        }

        fn job(&self, requires_approval: bool) -> Job {
            let mut job = Job::new("restart nginx", serde_json::json!({"command": "systemctl restart nginx"}));
            job.targets = vec!["web-01".into(), "web-02".into()];
            job.requires_approval = requires_approval;
            self.catalog.register_job(&job, self.clock.now()).unwrap();
            job
        }

        fn schedule(&self, new: NewSchedule) -> JobSchedule {
            self.store.create_schedule(new, self.clock.now()).unwrap()
        }

        fn every_minute(&self, job_id: JobId) -> JobSchedule {
            self.schedule(NewSchedule::new(
                job_id,
                "every minute",
                ScheduleRule::Interval {
                    interval_seconds: 60,
                },
            ))
        }
    }

    #[tokio::test]
    async fn one_time_schedule_fires_once_then_expires() {
        let h = Harness::in_memory();
        let engine = Arc::new(RecordingEngine::default());
        let d = h.dispatcher(engine.clone());
        let job = h.job(false);

        let mut new = NewSchedule::new(job.id, "one shot", ScheduleRule::OneTime);
        new.start_date = Some(at("2024-12-31T23:00:00Z"));
        let s = h.schedule(new);
        assert_eq!(s.next_run_at, Some(at("2024-12-31T23:00:00Z")));

        let report = d.tick().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.handed_off, 1);

        let s = h.store.get_schedule(&s.id).unwrap();
        assert_eq!(s.status, ScheduleStatus::Expired);
        assert_eq!(s.next_run_at, None);
        assert_eq!(s.current_runs, 1);
        assert_eq!(s.next_fire(h.clock.now()).unwrap(), None);

        h.clock.advance(ChronoDuration::hours(1));
        assert_eq!(d.tick().await.unwrap().created, 0);

        let executions = h.store.list_executions(&s.id, 10).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].scheduled_at, at("2024-12-31T23:00:00Z"));
        assert_eq!(executions[0].job_execution_id.as_deref(), Some("JEX-1"));
        assert_eq!(engine.count(), 1);

        let sent = engine.submitted.lock().unwrap()[0].clone();
        assert_eq!(sent.targets, job.targets);
        assert_eq!(sent.execution_serial, executions[0].serial);
    }

    #[tokio::test]
    async fn missing_approval_quorum_skips_but_advances() {
        let h = Harness::in_memory();
        let engine = Arc::new(RecordingEngine::default());
        let d = h.dispatcher(engine.clone());
        let job = h.job(true);
        h.approvals.insert(ApprovalRecord {
            job_id: job.id,
            required_approvals: 2,
            current_approvals: 1,
            status: ApprovalStatus::Pending,
        });
        let s = h.every_minute(job.id);

        h.clock.advance(ChronoDuration::seconds(60));
        let report = d.tick().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(engine.count(), 0);

        let executions = h.store.list_executions(&s.id, 10).unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Skipped);
        assert!(executions[0].error_message.as_deref().unwrap().contains("1/2"));

        let s = h.store.get_schedule(&s.id).unwrap();
        assert_eq!(s.next_run_at, Some(at("2025-01-01T00:02:00Z")));
        assert_eq!(s.current_runs, 1);
    }

    #[tokio::test]
    async fn handoff_timeout_fails_execution_without_touching_schedule() {
        let h = Harness::in_memory();
        let d = h.dispatcher(Arc::new(HangingEngine));
        let job = h.job(false);
        let s = h.every_minute(job.id);

        h.clock.advance(ChronoDuration::seconds(60));
        let report = d.tick().await.unwrap();
        assert_eq!(report.handoff_failed, 1);

        let execution = &h.store.list_executions(&s.id, 10).unwrap()[0];
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("HANDOFF_TIMEOUT"));
        assert!(execution.completed_at.is_some());

        let s = h.store.get_schedule(&s.id).unwrap();
        assert_eq!(s.next_run_at, Some(at("2025-01-01T00:02:00Z")));
        assert_eq!(s.status, ScheduleStatus::Active);
    }

    #[tokio::test]
    async fn rejected_handoff_is_recorded() {
        let h = Harness::in_memory();
        let d = h.dispatcher(Arc::new(RejectingEngine));
        let job = h.job(false);
        let s = h.every_minute(job.id);

        h.clock.advance(ChronoDuration::seconds(60));
        d.tick().await.unwrap();
        let execution = &h.store.list_executions(&s.id, 10).unwrap()[0];
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.error_message.as_deref(),
            Some("HANDOFF_REJECTED: Handoff rejected: no capacity")
        );
    }

    #[tokio::test]
    async fn max_runs_caps_and_expires() {
        let h = Harness::in_memory();
        let engine = Arc::new(RecordingEngine::default());
        let d = h.dispatcher(engine.clone());
        let job = h.job(false);
        let mut new = NewSchedule::new(
            job.id,
            "twice",
            ScheduleRule::Interval {
                interval_seconds: 60,
            },
        );
        new.max_runs = Some(2);
        let s = h.schedule(new);

        for _ in 0..4 {
            h.clock.advance(ChronoDuration::seconds(60));
            d.tick().await.unwrap();
        }

        let s = h.store.get_schedule(&s.id).unwrap();
        assert_eq!(s.current_runs, 2);
        assert!(s.runs_exhausted());
        assert_eq!(s.status, ScheduleStatus::Expired);
        assert_eq!(s.next_run_at, None);
        assert_eq!(engine.count(), 2);
    }

    #[tokio::test]
    async fn missed_slots_collapse_into_one_execution() {
        let h = Harness::in_memory();
        let engine = Arc::new(RecordingEngine::default());
        let d = h.dispatcher(engine.clone());
        let job = h.job(false);
        let s = h.every_minute(job.id);

        h.clock.advance(ChronoDuration::seconds(60 * 10 + 30));
        let report = d.tick().await.unwrap();
        assert_eq!(report.created, 1);

        let s = h.store.get_schedule(&s.id).unwrap();
        assert_eq!(s.last_run_at, Some(at("2025-01-01T00:01:00Z")));
        assert_eq!(s.next_run_at, Some(at("2025-01-01T00:11:00Z")));
    }

    #[tokio::test]
    async fn missing_job_consumes_slot_as_skipped() {
        let h = Harness::in_memory();
        let engine = Arc::new(RecordingEngine::default());
        let d = h.dispatcher(engine.clone());
        let s = h.every_minute(JobId::new());

        h.clock.advance(ChronoDuration::seconds(60));
        let report = d.tick().await.unwrap();
        assert_eq!(report.skipped, 1);
        let execution = &h.store.list_executions(&s.id, 10).unwrap()[0];
        assert_eq!(execution.status, ExecutionStatus::Skipped);
        assert!(execution
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("JOB_NOT_FOUND: "));
        assert_eq!(engine.count(), 0);
    }

    #[tokio::test]
    async fn broken_schedule_is_disabled_without_stopping_the_tick() {
        let h = Harness::in_memory();
        let engine = Arc::new(RecordingEngine::default());
        let d = h.dispatcher(engine.clone());
        let job = h.job(false);
        let good = h.every_minute(job.id);
        let broken = h.schedule(NewSchedule::new(
            job.id,
            "broken",
            ScheduleRule::Cron {
                cron_expression: "* * * * *".into(),
            },
        ));
        // Corrupt the stored expression behind the store's back.
        h.store
            .lock()
            .unwrap()
            .execute(
                "UPDATE job_schedules SET cron_expression = '99 * * * *' WHERE id = ?1",
                [broken.id.to_string()],
            )
            .unwrap();

        h.clock.advance(ChronoDuration::seconds(60));
        let report = d.tick().await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.handed_off, 1);

        let broken = h.store.get_schedule(&broken.id).unwrap();
        assert_eq!(broken.status, ScheduleStatus::Disabled);
        assert_eq!(broken.next_run_at, None);
        assert!(broken
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("TRIGGER_COMPUTATION_ERROR"));
        assert!(h.store.list_executions(&broken.id, 10).unwrap().is_empty());
        assert_eq!(h.store.list_executions(&good.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_tick_at_same_instant_creates_nothing() {
        let h = Harness::in_memory();
        let engine = Arc::new(RecordingEngine::default());
        let d = h.dispatcher(engine.clone());
        let job = h.job(false);
        let s = h.every_minute(job.id);

        h.clock.advance(ChronoDuration::seconds(60));
        d.tick().await.unwrap();
        // A stale scan result replayed against the committed state.
        let stale = {
            let mut conn = h.store.lock().unwrap();
            claim_slot(&mut conn, &s.id, at("2025-01-01T00:01:00Z"), h.clock.now(), None).unwrap()
        };
        assert!(matches!(stale, ClaimOutcome::Stale));
        assert_eq!(d.tick().await.unwrap().created, 0);
        assert_eq!(h.store.list_executions(&s.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn two_dispatchers_on_one_database_fire_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.db");
        let path = path.to_str().unwrap();
        let timeout = Duration::from_secs(5);

        let a = Harness::new(ScheduleStore::new(crate::db::open(path, timeout).unwrap()).unwrap());
        let b = Harness::new(ScheduleStore::new(crate::db::open(path, timeout).unwrap()).unwrap());
        let engine_a = Arc::new(RecordingEngine::default());
        let engine_b = Arc::new(RecordingEngine::default());
        let da = a.dispatcher(engine_a.clone());
        let db = b.dispatcher(engine_b.clone());

        let job = a.job(false);
        let s = a.every_minute(job.id);
        a.clock.advance(ChronoDuration::seconds(60));
        b.clock.set(a.clock.now());

        let (ra, rb) = tokio::join!(da.tick(), db.tick());
        assert_eq!(ra.unwrap().created + rb.unwrap().created, 1);
        assert_eq!(engine_a.count() + engine_b.count(), 1);
        assert_eq!(a.store.list_executions(&s.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_claims_race_to_a_single_execution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        let path = path.to_str().unwrap().to_string();
        let timeout = Duration::from_secs(5);

        let first = ScheduleStore::new(crate::db::open(&path, timeout).unwrap()).unwrap();
        let second = ScheduleStore::new(crate::db::open(&path, timeout).unwrap()).unwrap();
        let created = at("2025-01-01T00:00:00Z");
        let s = first
            .create_schedule(
                NewSchedule::new(
                    JobId::new(),
                    "race",
                    ScheduleRule::Interval {
                        interval_seconds: 60,
                    },
                ),
                created,
            )
            .unwrap();
        let slot = s.next_run_at.unwrap();
        let now = slot + ChronoDuration::seconds(1);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [first.clone(), second]
            .into_iter()
            .map(|store| {
                let barrier = Arc::clone(&barrier);
                let id = s.id;
                std::thread::spawn(move || {
                    barrier.wait();
                    let mut conn = store.lock().unwrap();
                    matches!(
                        claim_slot(&mut conn, &id, slot, now, None).unwrap(),
                        ClaimOutcome::Claimed { .. }
                    )
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(first.list_executions(&s.id, 10).unwrap().len(), 1);
        assert_eq!(first.get_schedule(&s.id).unwrap().current_runs, 1);
    }

    #[tokio::test]
    async fn startup_recovery_hands_off_or_skips() {
        let h = Harness::in_memory();
        let engine = Arc::new(RecordingEngine::default());
        let d = h.dispatcher(engine.clone());
        let job = h.job(false);
        let retired = h.job(false);
        let live = h.every_minute(job.id);
        let paused = h.every_minute(job.id);
        let orphaned = h.every_minute(retired.id);

        // Simulate a crash between claim and handoff for every schedule.
        h.clock.advance(ChronoDuration::seconds(60));
        let now = h.clock.now();
        for s in [&live, &paused, &orphaned] {
            let mut conn = h.store.lock().unwrap();
            let claimed = claim_slot(&mut conn, &s.id, s.next_run_at.unwrap(), now, None).unwrap();
            assert!(matches!(claimed, ClaimOutcome::Claimed { .. }));
        }
        h.store.pause(&paused.id, now).unwrap();
        h.store
            .lock()
            .unwrap()
            .execute("DELETE FROM jobs WHERE id = ?1", [retired.id.to_string()])
            .unwrap();

        h.clock.advance(ChronoDuration::seconds(5));
        assert_eq!(d.recover_stranded().await.unwrap(), 3);
        assert_eq!(engine.count(), 1);

        let live_exec = &h.store.list_executions(&live.id, 10).unwrap()[0];
        assert_eq!(live_exec.status, ExecutionStatus::Scheduled);
        assert_eq!(live_exec.job_execution_id.as_deref(), Some("JEX-1"));
        let paused_exec = &h.store.list_executions(&paused.id, 10).unwrap()[0];
        assert_eq!(paused_exec.status, ExecutionStatus::Skipped);
        let orphaned_exec = &h.store.list_executions(&orphaned.id, 10).unwrap()[0];
        assert_eq!(orphaned_exec.status, ExecutionStatus::Skipped);
        assert_eq!(
            orphaned_exec.error_message.as_deref(),
            Some(format!("JOB_NOT_FOUND: Job not found: {}", retired.id).as_str())
        );
        assert!(orphaned_exec.completed_at.is_some());

        assert_eq!(d.recover_stranded().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let h = Harness::in_memory();
        let d = h.dispatcher(Arc::new(RecordingEngine::default()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(d.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
