//! Five-field cron expressions evaluated in an IANA timezone, backed by
//! [`croner`].
//!
//! Fields: minute (0-59), hour (0-23), day-of-month (1-31), month (1-12 or
//! `JAN`-`DEC`), day-of-week (0-7 or `SUN`-`SAT`, both 0 and 7 are Sunday).
//! Each field accepts `*`, lists (`1,15`), ranges (`MON-FRI`) and steps
//! (`*/15`, `10-40/5`, `5/10`), plus croner's `L`, `W` and `#` extensions.
//! When day-of-month and day-of-week are both restricted a day matches if
//! *either* does; if either field starts with `*` both must match.

use chrono::{DateTime, SubsecRound, Utc};
use chrono_tz::Tz;
use croner::errors::CronError;
use croner::Cron;

use crate::error::{Result, SchedulerError};

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    cron: Cron,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let expanded = match trimmed {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(invalid(expr, format!("unknown macro {other}")));
            }
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expr,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }
        if let Some(field) = fields.iter().find(|f| f.split(',').any(str::is_empty)) {
            return Err(invalid(expr, format!("empty list item in {field:?}")));
        }

        let mut cron = Cron::new(expanded);
        // croner only treats a bare `*` as unrestricted; `*/2` must AND too.
        if star_prefixed(fields[2]) || star_prefixed(fields[4]) {
            cron.with_dom_and_dow();
        }
        let cron = cron.parse().map_err(|e| invalid(expr, e))?;

        Ok(Self {
            source: trimmed.to_string(),
            cron,
        })
    }

    /// Earliest instant strictly after `after` that matches, evaluated in `tz`.
    ///
    /// Local times skipped by a DST jump never fire; local times repeated by
    /// a DST fold fire at their first occurrence only. Returns `Ok(None)` if
    /// nothing matches before croner's search horizon (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>, tz: &Tz) -> Result<Option<DateTime<Utc>>> {
        let mut cursor = after.trunc_subsecs(0).with_timezone(tz);
        loop {
            let found = match self.cron.find_next_occurrence(&cursor, false) {
                Ok(found) => found,
                Err(CronError::TimeSearchLimitExceeded) => return Ok(None),
                Err(e) => return Err(self.failed(e)),
            };
            // croner moves a time inside a DST gap to the end of the gap,
            // and resolves a fold to its earlier instant.
            let exact = self.cron.is_time_matching(&found).map_err(|e| self.failed(e))?;
            let utc = found.with_timezone(&Utc);
            if exact && utc > after {
                return Ok(Some(utc));
            }
            cursor = found;
        }
    }

    fn failed(&self, e: CronError) -> SchedulerError {
        SchedulerError::TriggerComputation(format!("cron expression {:?}: {e}", self.source))
    }
}

fn star_prefixed(field: &str) -> bool {
    field.starts_with('*') && field != "*"
}

fn invalid(expr: &str, reason: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::InvalidScheduleConfig(format!("cron expression {expr:?}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, after: &str, tz: Tz) -> Option<DateTime<Utc>> {
        CronExpr::parse(expr).unwrap().next_after(at(after), &tz).unwrap()
    }

    #[test]
    fn weekday_morning_from_saturday() {
        assert_eq!(
            next("0 9 * * MON-FRI", "2025-01-04T10:00:00Z", Tz::UTC),
            Some(at("2025-01-06T09:00:00Z"))
        );
    }

    #[test]
    fn result_is_strictly_after() {
        assert_eq!(
            next("*/15 * * * *", "2025-01-01T00:15:00Z", Tz::UTC),
            Some(at("2025-01-01T00:30:00Z"))
        );
        assert_eq!(
            next("*/15 * * * *", "2025-01-01T00:14:59.900Z", Tz::UTC),
            Some(at("2025-01-01T00:15:00Z"))
        );
    }

    #[test]
    fn dom_and_dow_are_or_combined_when_both_restricted() {
        // 2025-06-01 is a Sunday; Mondays are the 2nd and 9th, the 13th is a Friday.
        let expr = CronExpr::parse("0 0 13 * MON").unwrap();
        let mut t = at("2025-06-01T00:00:00Z");
        let mut fired = Vec::new();
        for _ in 0..4 {
            t = expr.next_after(t, &Tz::UTC).unwrap().unwrap();
            fired.push(t.day());
        }
        assert_eq!(fired, vec![2, 9, 13, 16]);
    }

    #[test]
    fn star_prefixed_dom_keeps_and_semantics() {
        // Odd days that are also Mondays: June 2 is even, June 9 is odd.
        assert_eq!(
            next("0 0 */2 * MON", "2025-06-01T00:00:00Z", Tz::UTC),
            Some(at("2025-06-09T00:00:00Z"))
        );
    }

    #[test]
    fn evaluated_in_schedule_timezone() {
        assert_eq!(
            next("0 9 * * *", "2025-01-15T00:00:00Z", chrono_tz::Europe::Berlin),
            Some(at("2025-01-15T08:00:00Z"))
        );
        assert_eq!(
            next("0 9 * * *", "2025-07-15T00:00:00Z", chrono_tz::Europe::Berlin),
            Some(at("2025-07-15T07:00:00Z"))
        );
    }

    #[test]
    fn nonexistent_local_time_is_skipped() {
        // 2025-03-09 02:30 does not exist in New York.
        assert_eq!(
            next("30 2 * * *", "2025-03-09T06:00:00Z", chrono_tz::America::New_York),
            Some(at("2025-03-10T06:30:00Z"))
        );
    }

    #[test]
    fn repeated_local_time_fires_once() {
        // 2025-11-02 01:30 happens twice in New York; first occurrence is 05:30Z.
        let ny = chrono_tz::America::New_York;
        assert_eq!(
            next("30 1 * * *", "2025-11-02T04:00:00Z", ny),
            Some(at("2025-11-02T05:30:00Z"))
        );
        assert_eq!(
            next("30 1 * * *", "2025-11-02T05:30:00Z", ny),
            Some(at("2025-11-03T06:30:00Z"))
        );
    }

    #[test]
    fn leap_day_and_impossible_dates() {
        assert_eq!(
            next("0 0 29 2 *", "2025-03-01T00:00:00Z", Tz::UTC),
            Some(at("2028-02-29T00:00:00Z"))
        );
        assert_eq!(next("0 0 30 2 *", "2025-01-01T00:00:00Z", Tz::UTC), None);
    }

    #[test]
    fn names_steps_and_macros() {
        assert_eq!(
            next("0 12 1 jan,JUL *", "2025-02-01T00:00:00Z", Tz::UTC),
            Some(at("2025-07-01T12:00:00Z"))
        );
        assert_eq!(
            next("5/20 * * * *", "2025-01-01T00:26:00Z", Tz::UTC),
            Some(at("2025-01-01T00:45:00Z"))
        );
        assert_eq!(
            next("0 0 * * 7", "2025-01-01T00:00:00Z", Tz::UTC),
            Some(at("2025-01-05T00:00:00Z"))
        );
        assert_eq!(
            next("@weekly", "2025-01-01T00:00:00Z", Tz::UTC),
            Some(at("2025-01-05T00:00:00Z"))
        );
        assert_eq!(
            next("@hourly", "2025-01-01T00:00:00Z", Tz::UTC),
            Some(at("2025-01-01T01:00:00Z"))
        );
    }

    #[test]
    fn last_day_and_nth_weekday() {
        assert_eq!(
            next("0 0 L 2 *", "2025-01-01T00:00:00Z", Tz::UTC),
            Some(at("2025-02-28T00:00:00Z"))
        );
        // Second Monday of June 2025.
        assert_eq!(
            next("0 0 * * 1#2", "2025-06-01T00:00:00Z", Tz::UTC),
            Some(at("2025-06-09T00:00:00Z"))
        );
    }

    #[test]
    fn fold_second_pass_does_not_refire() {
        // 06:10Z is 01:10 EST, inside the repeated hour of 2025-11-02.
        assert_eq!(
            next("*/15 * * * *", "2025-11-02T06:10:00Z", chrono_tz::America::New_York),
            Some(at("2025-11-02T07:00:00Z"))
        );
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "10-5 * * * *",
            "1,,2 * * * *",
            "* * * * FOO",
            "@fortnightly",
        ] {
            assert!(CronExpr::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn successive_fires_are_monotonic() {
        let expr = CronExpr::parse("*/7 3-5 * * *").unwrap();
        let mut now = at("2025-01-01T00:00:00Z");
        let mut last = None;
        for _ in 0..100 {
            let fire = expr.next_after(now, &Tz::UTC).unwrap().unwrap();
            assert!(fire > now);
            if let Some(prev) = last {
                assert!(fire >= prev);
            }
            last = Some(fire);
            now = fire;
        }
    }
}
