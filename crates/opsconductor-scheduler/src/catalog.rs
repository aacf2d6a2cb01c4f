use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsconductor_core::JobId;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{conversion_err, ts};
use crate::error::Result;
use crate::store::{lock_conn, ScheduleStore};

/// A unit of automation work as the scheduler sees it: read-only config
/// plus the resolved target set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: Option<String>,
    /// Opaque action definition handed to the execution engine verbatim.
    pub action_config: serde_json::Value,
    /// Resolved target identifiers (hostnames, device ids, ...).
    pub targets: Vec<String>,
    pub timeout_secs: Option<u64>,
    /// Retry policy belongs to the job and is enforced by the engine.
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub requires_approval: bool,
    pub created_by: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, action_config: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            description: None,
            action_config,
            targets: Vec::new(),
            timeout_secs: None,
            max_retries: 0,
            retry_delay_secs: 0,
            requires_approval: false,
            created_by: None,
        }
    }
}

/// Read access to the external job/target store.
#[async_trait]
pub trait JobCatalog: Send + Sync {
    async fn fetch_job(&self, job_id: &JobId) -> Result<Option<Job>>;
}

/// Jobs in the `jobs` / `job_targets` tables.
pub struct SqliteJobCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobCatalog {
    pub fn new(store: &ScheduleStore) -> Self {
        Self {
            conn: store.shared(),
        }
    }

    /// Insert or replace a job and its target list.
    pub fn register_job(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO jobs
             (id, name, description, action_config, timeout_secs, max_retries,
              retry_delay_secs, requires_approval, created_by, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                action_config = excluded.action_config,
                timeout_secs = excluded.timeout_secs,
                max_retries = excluded.max_retries,
                retry_delay_secs = excluded.retry_delay_secs,
                requires_approval = excluded.requires_approval,
                updated_at = excluded.updated_at",
            params![
                job.id.to_string(),
                job.name,
                job.description,
                serde_json::to_string(&job.action_config)?,
                job.timeout_secs.map(|t| t as i64),
                job.max_retries,
                job.retry_delay_secs as i64,
                job.requires_approval,
                job.created_by,
                ts(&now),
            ],
        )?;
        tx.execute("DELETE FROM job_targets WHERE job_id = ?1", [job.id.to_string()])?;
        for target in &job.targets {
            tx.execute(
                "INSERT OR IGNORE INTO job_targets (job_id, target) VALUES (?1, ?2)",
                params![job.id.to_string(), target],
            )?;
        }
        tx.commit()?;
        info!(job_id = %job.id, name = %job.name, targets = job.targets.len(), "job registered");
        Ok(())
    }
}

#[async_trait]
impl JobCatalog for SqliteJobCatalog {
    async fn fetch_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        let conn = lock_conn(&self.conn)?;
        let job = conn
            .query_row(
                "SELECT name, description, action_config, timeout_secs, max_retries,
                        retry_delay_secs, requires_approval, created_by
                 FROM jobs WHERE id = ?1",
                [job_id.to_string()],
                |row| {
                    let action: String = row.get(2)?;
                    Ok(Job {
                        id: *job_id,
                        name: row.get(0)?,
                        description: row.get(1)?,
                        action_config: serde_json::from_str(&action)
                            .map_err(|e| conversion_err(2, e))?,
                        targets: Vec::new(),
                        timeout_secs: row.get::<_, Option<i64>>(3)?.map(|t| t as u64),
                        max_retries: row.get(4)?,
                        retry_delay_secs: row.get::<_, i64>(5)? as u64,
                        requires_approval: row.get(6)?,
                        created_by: row.get(7)?,
                    })
                },
            )
            .optional()?;

        let Some(mut job) = job else {
            return Ok(None);
        };
        let mut stmt =
            conn.prepare_cached("SELECT target FROM job_targets WHERE job_id = ?1 ORDER BY target")?;
        job.targets = stmt
            .query_map([job_id.to_string()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(Some(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_fetch_with_targets() {
        let store = ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let catalog = SqliteJobCatalog::new(&store);

        let mut job = Job::new("rotate logs", serde_json::json!({"command": "logrotate -f"}));
        job.targets = vec!["web-02".into(), "web-01".into()];
        job.timeout_secs = Some(300);
        job.max_retries = 2;
        catalog.register_job(&job, Utc::now()).unwrap();

        let fetched = catalog.fetch_job(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.targets, vec!["web-01".to_string(), "web-02".to_string()]);
        assert_eq!(fetched.action_config, job.action_config);
        assert_eq!(fetched.timeout_secs, Some(300));

        job.targets = vec!["db-01".into()];
        catalog.register_job(&job, Utc::now()).unwrap();
        let fetched = catalog.fetch_job(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.targets, vec!["db-01".to_string()]);
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let store = ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let catalog = SqliteJobCatalog::new(&store);
        assert!(catalog.fetch_job(&JobId::new()).await.unwrap().is_none());
    }
}
