use chrono::{DateTime, Utc};
use opsconductor_core::{ExecutionId, JobId, ScheduleId};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Recurrence rule of a schedule. Exactly one set of type parameters exists
/// per variant, which is how the cron/interval exclusivity is enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum ScheduleRule {
    /// Standard 5-field cron expression evaluated in the schedule's timezone.
    Cron { cron_expression: String },
    /// Fixed period in seconds.
    Interval { interval_seconds: u64 },
    /// Fires once at `start_date`.
    OneTime,
}

impl ScheduleRule {
    /// Value of the `schedule_type` column.
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleRule::Cron { .. } => "cron",
            ScheduleRule::Interval { .. } => "interval",
            ScheduleRule::OneTime => "one_time",
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            ScheduleRule::Cron { cron_expression } => Some(cron_expression),
            _ => None,
        }
    }

    pub fn interval_seconds(&self) -> Option<u64> {
        match self {
            ScheduleRule::Interval { interval_seconds } => Some(*interval_seconds),
            _ => None,
        }
    }

    /// Rebuild a rule from its three persisted columns, rejecting rows where
    /// the populated fields do not match the declared type.
    pub fn from_columns(
        kind: &str,
        cron_expression: Option<String>,
        interval_seconds: Option<i64>,
    ) -> Result<Self> {
        match (kind, cron_expression, interval_seconds) {
            ("cron", Some(cron_expression), None) => Ok(ScheduleRule::Cron { cron_expression }),
            ("interval", None, Some(secs)) if secs > 0 => Ok(ScheduleRule::Interval {
                interval_seconds: secs as u64,
            }),
            ("one_time", None, None) => Ok(ScheduleRule::OneTime),
            (kind, cron, interval) => Err(SchedulerError::InvalidScheduleConfig(format!(
                "schedule_type {kind} with cron_expression={cron:?} interval_seconds={interval:?}"
            ))),
        }
    }
}

/// Lifecycle status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Disabled,
    /// No future occurrence: `end_date` passed, `max_runs` reached, or a
    /// one-time schedule already fired.
    Expired,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Disabled => "disabled",
            ScheduleStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ScheduleStatus::Active),
            "paused" => Ok(ScheduleStatus::Paused),
            "disabled" => Ok(ScheduleStatus::Disabled),
            "expired" => Ok(ScheduleStatus::Expired),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// A persisted schedule record (`job_schedules` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub id: ScheduleId,
    /// `JSCHED-########`, assigned at creation.
    pub serial: String,
    pub job_id: JobId,
    pub name: String,
    pub description: Option<String>,
    pub rule: ScheduleRule,
    /// IANA timezone name, e.g. `UTC` or `Europe/Berlin`.
    pub timezone: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub status: ScheduleStatus,
    pub current_runs: u32,
    pub max_runs: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Last operator-facing error note (e.g. why the schedule was disabled).
    pub last_error: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSchedule {
    /// Whether the dispatch loop may fire this schedule at all.
    pub fn is_enabled(&self) -> bool {
        self.is_active && self.status == ScheduleStatus::Active
    }

    /// True when `max_runs` is set and has been reached.
    pub fn runs_exhausted(&self) -> bool {
        self.max_runs.is_some_and(|max| self.current_runs >= max)
    }
}

/// Input for creating a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub job_id: JobId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rule: ScheduleRule,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_runs: Option<u32>,
    /// Create in `paused` instead of `active`.
    #[serde(default)]
    pub start_paused: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl NewSchedule {
    pub fn new(job_id: JobId, name: impl Into<String>, rule: ScheduleRule) -> Self {
        Self {
            job_id,
            name: name.into(),
            description: None,
            rule,
            timezone: default_timezone(),
            start_date: None,
            end_date: None,
            max_runs: None,
            start_paused: false,
            created_by: None,
        }
    }
}

pub fn default_timezone() -> String {
    "UTC".to_string()
}

/// Partial update of a schedule's configuration. `None` leaves a field as is;
/// the nested options clear a nullable field when set to `Some(None)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub rule: Option<ScheduleRule>,
    pub timezone: Option<String>,
    pub start_date: Option<Option<DateTime<Utc>>>,
    pub end_date: Option<Option<DateTime<Utc>>>,
    pub max_runs: Option<Option<u32>>,
}

/// Lifecycle state of one concrete firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Scheduled => "scheduled",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Skipped
        )
    }

    /// The execution state machine:
    ///
    /// ```text
    /// scheduled -> running -> completed | failed
    /// scheduled -> failed     (handoff failed, never started)
    /// scheduled -> skipped    (approval missing / schedule disabled)
    /// ```
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Scheduled, Running)
                | (Scheduled, Failed)
                | (Scheduled, Skipped)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ExecutionStatus::Scheduled),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One concrete firing of a schedule (`schedule_executions` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub id: ExecutionId,
    /// `SEXEC-########`, assigned at creation.
    pub serial: String,
    pub schedule_id: ScheduleId,
    pub job_id: JobId,
    /// Reference returned by the execution engine once it accepted the request.
    pub job_execution_id: Option<String>,
    /// The fire time produced by the trigger calculator.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    /// Free-form context captured at creation (schedule serial, targets, ...).
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
