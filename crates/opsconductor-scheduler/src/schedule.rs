//! Trigger calculator: schedule state + "now" -> next fire time.
//!
//! Everything here is pure. Callers pass the evaluation instant explicitly;
//! nothing reads the wall clock.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::cron::CronExpr;
use crate::error::{Result, SchedulerError};
use crate::types::{JobSchedule, ScheduleRule};

/// Ten years; anything longer is almost certainly a unit mistake.
pub const MAX_INTERVAL_SECS: u64 = 10 * 366 * 24 * 3600;

/// The inputs the trigger calculator looks at, borrowed from a schedule.
#[derive(Debug, Clone, Copy)]
pub struct TriggerInput<'a> {
    pub rule: &'a ScheduleRule,
    pub timezone: &'a str,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub max_runs: Option<u32>,
    pub current_runs: u32,
}

impl<'a> From<&'a JobSchedule> for TriggerInput<'a> {
    fn from(s: &'a JobSchedule) -> Self {
        Self {
            rule: &s.rule,
            timezone: &s.timezone,
            start_date: s.start_date,
            end_date: s.end_date,
            last_run_at: s.last_run_at,
            max_runs: s.max_runs,
            current_runs: s.current_runs,
        }
    }
}

impl JobSchedule {
    /// Shorthand for [`next_fire`] on this schedule's own state.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        next_fire(&TriggerInput::from(self), now)
    }
}

/// Compute the next fire time, or `None` when the schedule has no future
/// occurrence (end date passed, run cap reached, one-time already fired).
///
/// * `cron`: first match strictly after `max(now, last_run_at)` and not
///   before `start_date`, in the schedule's timezone.
/// * `interval`: `start_date` (or `now + interval` without one) until the
///   first run, then `last_run_at + interval`. Slots missed while nothing
///   was dispatching collapse into the first grid point after `now`.
/// * `one_time`: `start_date`, even if already in the past, until it has run.
///
/// Errors are [`SchedulerError::TriggerComputation`]: a stored schedule that
/// can no longer be evaluated (bad cron text, unknown timezone).
pub fn next_fire(input: &TriggerInput<'_>, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if input.max_runs.is_some_and(|max| input.current_runs >= max) {
        return Ok(None);
    }
    if input.end_date.is_some_and(|end| end <= now) {
        return Ok(None);
    }

    let candidate = match input.rule {
        ScheduleRule::OneTime => {
            if input.current_runs >= 1 {
                None
            } else {
                Some(input.start_date.ok_or_else(|| {
                    SchedulerError::TriggerComputation("one_time schedule without start_date".into())
                })?)
            }
        }
        ScheduleRule::Interval { interval_seconds } => interval_next(
            *interval_seconds,
            input.last_run_at,
            input.start_date,
            now,
        )?,
        ScheduleRule::Cron { cron_expression } => {
            let cron = CronExpr::parse(cron_expression)
                .map_err(|e| SchedulerError::TriggerComputation(e.to_string()))?;
            let tz = parse_timezone(input.timezone)
                .map_err(|e| SchedulerError::TriggerComputation(e.to_string()))?;
            cron_next(&cron, &tz, input.last_run_at, input.start_date, now)?
        }
    };

    Ok(candidate.filter(|t| input.end_date.map_or(true, |end| *t < end)))
}

fn cron_next(
    cron: &CronExpr,
    tz: &Tz,
    last_run_at: Option<DateTime<Utc>>,
    start_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let floor = last_run_at.map_or(now, |last| last.max(now));
    match start_date {
        // Start is inclusive: back off a nanosecond so a match exactly at
        // `start` qualifies.
        Some(start) if start > floor => cron.next_after(start - Duration::nanoseconds(1), tz),
        _ => cron.next_after(floor, tz),
    }
}

fn interval_next(
    interval_seconds: u64,
    last_run_at: Option<DateTime<Utc>>,
    start_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let step = i64::try_from(interval_seconds)
        .ok()
        .filter(|s| *s > 0)
        .and_then(Duration::try_seconds)
        .ok_or_else(|| {
            SchedulerError::TriggerComputation(format!("interval {interval_seconds}s out of range"))
        })?;

    let (anchor, first) = match (last_run_at, start_date) {
        (Some(last), _) => (last, last + step),
        (None, Some(start)) => (start, start),
        (None, None) => return Ok(now.checked_add_signed(step)),
    };

    let next = if first > now || (last_run_at.is_none() && first == now) {
        Some(first)
    } else {
        let step_ms = step.num_milliseconds();
        let behind_ms = (now - anchor).num_milliseconds();
        (behind_ms / step_ms + 1)
            .checked_mul(step_ms)
            .and_then(Duration::try_milliseconds)
            .and_then(|offset| anchor.checked_add_signed(offset))
    };

    // A start date moved past the last run still holds back the next fire.
    Ok(match (next, start_date) {
        (Some(t), Some(start)) if t < start => Some(start),
        (next, _) => next,
    })
}

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidScheduleConfig(format!("unknown timezone {name:?}")))
}

/// Create/update-time validation. Anything that passes here can be
/// evaluated by [`next_fire`] without error.
pub fn validate_config(
    rule: &ScheduleRule,
    timezone: &str,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    max_runs: Option<u32>,
    now: DateTime<Utc>,
) -> Result<()> {
    let tz = parse_timezone(timezone)?;

    if let (Some(start), Some(end)) = (start_date, end_date) {
        if end <= start {
            return Err(SchedulerError::InvalidScheduleConfig(format!(
                "end_date {end} must be after start_date {start}"
            )));
        }
    }
    if max_runs == Some(0) {
        return Err(SchedulerError::InvalidScheduleConfig(
            "max_runs must be at least 1".into(),
        ));
    }

    match rule {
        ScheduleRule::Cron { cron_expression } => {
            let cron = CronExpr::parse(cron_expression)?;
            let from = start_date.map_or(now, |start| start.max(now));
            let next = cron
                .next_after(from, &tz)
                .map_err(|e| SchedulerError::InvalidScheduleConfig(e.to_string()))?;
            if next.is_none() {
                return Err(SchedulerError::InvalidScheduleConfig(format!(
                    "cron expression {cron_expression:?} never fires"
                )));
            }
        }
        ScheduleRule::Interval { interval_seconds } => {
            if *interval_seconds == 0 || *interval_seconds > MAX_INTERVAL_SECS {
                return Err(SchedulerError::InvalidScheduleConfig(format!(
                    "interval_seconds must be between 1 and {MAX_INTERVAL_SECS}"
                )));
            }
        }
        ScheduleRule::OneTime => {
            if start_date.is_none() {
                return Err(SchedulerError::InvalidScheduleConfig(
                    "one_time schedules require start_date".into(),
                ));
            }
        }
    }
    Ok(())
}
