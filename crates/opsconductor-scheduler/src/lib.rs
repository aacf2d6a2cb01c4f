//! `opsconductor-scheduler`: job scheduling core with SQLite persistence.
//!
//! # Overview
//!
//! Schedules bind a job to a recurrence rule and live in the
//! `job_schedules` table. The [`dispatch::Dispatcher`] ticks on a fixed
//! cadence, claims every schedule whose `next_run_at` has arrived, records a
//! [`types::ScheduleExecution`] for the slot and hands it to an
//! [`engine::ExecutionEngine`]. The engine reports progress back through the
//! [`tracker::ExecutionTracker`].
//!
//! # Schedule rules
//!
//! | Rule       | Behaviour                                                   |
//! |------------|-------------------------------------------------------------|
//! | `cron`     | 5-field cron in the schedule's timezone                     |
//! | `interval` | Every N seconds from `start_date` or the last run           |
//! | `one_time` | Once at `start_date`                                        |
//!
//! Every rule respects the optional `start_date` / `end_date` window and
//! `max_runs` cap. A schedule with no future occurrence becomes `expired`.

pub mod approval;
pub mod catalog;
pub mod clock;
pub mod cron;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod store;
pub mod tracker;
pub mod types;

pub use approval::{ApprovalGate, ApprovalRecord, ApprovalStatus, ApprovalStore, SqliteApprovalStore};
pub use catalog::{Job, JobCatalog, SqliteJobCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchSettings, Dispatcher, TickReport};
pub use engine::{ChannelEngine, ExecutionEngine, ExecutionRequest, HttpExecutionEngine, SubmitOutcome};
pub use error::{Result, SchedulerError};
pub use store::ScheduleStore;
pub use tracker::ExecutionTracker;
pub use types::{
    ExecutionStatus, JobSchedule, NewSchedule, ScheduleExecution, ScheduleRule, ScheduleStatus,
    ScheduleUpdate,
};
