use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Idempotent. Besides the scheduler's own tables this creates the read
/// models for the job catalog (`jobs`, `job_targets`) and the approval
/// store (`job_approvals`) so a single database file is self-contained.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS serial_sequences (
            name   TEXT    NOT NULL PRIMARY KEY,
            value  INTEGER NOT NULL
        ) STRICT;
        INSERT OR IGNORE INTO serial_sequences (name, value)
            VALUES ('JSCHED', 0), ('SEXEC', 0);

        CREATE TABLE IF NOT EXISTS jobs (
            id                 TEXT    NOT NULL PRIMARY KEY,
            name               TEXT    NOT NULL,
            description        TEXT,
            action_config      TEXT    NOT NULL DEFAULT '{}',  -- opaque JSON
            timeout_secs       INTEGER,
            max_retries        INTEGER NOT NULL DEFAULT 0,
            retry_delay_secs   INTEGER NOT NULL DEFAULT 0,
            requires_approval  INTEGER NOT NULL DEFAULT 0,
            created_by         TEXT,
            created_at         TEXT    NOT NULL,
            updated_at         TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_targets (
            job_id  TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            target  TEXT NOT NULL,
            PRIMARY KEY (job_id, target)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_approvals (
            job_id              TEXT    NOT NULL PRIMARY KEY,
            required_approvals  INTEGER NOT NULL,
            current_approvals   INTEGER NOT NULL DEFAULT 0,
            status              TEXT    NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'approved', 'rejected')),
            updated_at          TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_schedules (
            id                TEXT    NOT NULL PRIMARY KEY,
            serial            TEXT    NOT NULL UNIQUE,
            job_id            TEXT    NOT NULL,
            name              TEXT    NOT NULL,
            description       TEXT,
            schedule_type     TEXT    NOT NULL
                CHECK (schedule_type IN ('cron', 'interval', 'one_time')),
            cron_expression   TEXT,
            interval_seconds  INTEGER,
            timezone          TEXT    NOT NULL DEFAULT 'UTC',
            start_date        TEXT,
            end_date          TEXT,
            is_active         INTEGER NOT NULL DEFAULT 1,
            status            TEXT    NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'paused', 'disabled', 'expired')),
            current_runs      INTEGER NOT NULL DEFAULT 0,
            max_runs          INTEGER,
            next_run_at       TEXT,
            last_run_at       TEXT,
            last_error        TEXT,
            created_by        TEXT,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL,
            CHECK (
                (schedule_type = 'cron'
                    AND cron_expression IS NOT NULL AND interval_seconds IS NULL)
             OR (schedule_type = 'interval'
                    AND cron_expression IS NULL AND interval_seconds > 0)
             OR (schedule_type = 'one_time'
                    AND cron_expression IS NULL AND interval_seconds IS NULL
                    AND start_date IS NOT NULL)
            ),
            CHECK (max_runs IS NULL OR current_runs <= max_runs)
        ) STRICT;

        -- Due scan: WHERE status = 'active' AND next_run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_job_schedules_due
            ON job_schedules (status, next_run_at);

        CREATE TABLE IF NOT EXISTS schedule_executions (
            id                TEXT NOT NULL PRIMARY KEY,
            serial            TEXT NOT NULL UNIQUE,
            schedule_id       TEXT NOT NULL
                REFERENCES job_schedules(id) ON DELETE CASCADE,
            job_id            TEXT NOT NULL,
            job_execution_id  TEXT,
            scheduled_at      TEXT NOT NULL,
            started_at        TEXT,
            completed_at      TEXT,
            status            TEXT NOT NULL
                CHECK (status IN ('scheduled', 'running', 'completed', 'failed', 'skipped')),
            result_summary    TEXT,
            error_message     TEXT,
            context           TEXT NOT NULL DEFAULT '{}',
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            -- at most one firing per schedule per slot
            UNIQUE (schedule_id, scheduled_at)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedule_executions_schedule
            ON schedule_executions (schedule_id, scheduled_at DESC);
        CREATE INDEX IF NOT EXISTS idx_schedule_executions_status
            ON schedule_executions (status);
        ",
    )?;
    Ok(())
}

/// Open a file-backed connection with the pragmas every scheduler
/// connection needs. Each dispatcher instance should own one.
pub fn open(path: &str, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    configure(&conn, busy_timeout)?;
    Ok(conn)
}

/// Per-connection settings: cascade deletes and waiting on locked writers.
pub fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

/// Canonical timestamp text: RFC 3339, UTC, millisecond precision. A fixed
/// width keeps lexical and chronological order identical in SQL comparisons.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

/// Draw the next value of a display-serial sequence. Call inside the
/// transaction that inserts the row so a rollback returns the number.
pub(crate) fn next_serial(conn: &Connection, prefix: &str) -> Result<String> {
    let seq: i64 = conn.query_row(
        "UPDATE serial_sequences SET value = value + 1 WHERE name = ?1 RETURNING value",
        [prefix],
        |row| row.get(0),
    )?;
    Ok(opsconductor_core::types::format_serial(prefix, seq as u64))
}
