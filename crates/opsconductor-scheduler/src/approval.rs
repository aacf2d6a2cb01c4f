use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsconductor_core::JobId;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::Job;
use crate::db::{conversion_err, ts};
use crate::error::{Result, SchedulerError};
use crate::store::{lock_conn, ScheduleStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// Approval state of a job as kept by the approval workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub job_id: JobId,
    pub required_approvals: u32,
    pub current_approvals: u32,
    pub status: ApprovalStatus,
}

impl ApprovalRecord {
    /// Quorum reached *and* the request itself is approved.
    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved && self.current_approvals >= self.required_approvals
    }
}

/// Read side of the external approval workflow.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn fetch_approval(&self, job_id: &JobId) -> Result<Option<ApprovalRecord>>;
}

/// Outcome of the approval check for one due slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Open,
    Blocked { reason: String },
}

/// Holds back jobs flagged `requires_approval` until quorum is recorded.
/// Fails closed: no record means blocked.
#[derive(Clone)]
pub struct ApprovalGate {
    store: Arc<dyn ApprovalStore>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn ApprovalStore>) -> Self {
        Self { store }
    }

    pub async fn check(&self, job: &Job) -> Result<GateDecision> {
        if !job.requires_approval {
            return Ok(GateDecision::Open);
        }
        let decision = match self.store.fetch_approval(&job.id).await? {
            None => GateDecision::Blocked {
                reason: "approval required but no approval record exists".into(),
            },
            Some(record) if record.status == ApprovalStatus::Rejected => GateDecision::Blocked {
                reason: "approval request was rejected".into(),
            },
            Some(record) if record.is_approved() => GateDecision::Open,
            Some(record) => GateDecision::Blocked {
                reason: format!(
                    "awaiting approval: {}/{} approvals, status {}",
                    record.current_approvals,
                    record.required_approvals,
                    record.status.as_str()
                ),
            },
        };
        debug!(job_id = %job.id, ?decision, "approval gate evaluated");
        Ok(decision)
    }

    /// `isApproved(jobId)` for callers that only need the boolean.
    pub async fn is_approved(&self, job: &Job) -> Result<bool> {
        Ok(self.check(job).await? == GateDecision::Open)
    }
}

/// Approval records in the `job_approvals` table.
pub struct SqliteApprovalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteApprovalStore {
    pub fn new(store: &ScheduleStore) -> Self {
        Self {
            conn: store.shared(),
        }
    }

    /// Upsert a job's approval state. Written by the approval workflow (or
    /// an operator), never by the dispatch loop.
    pub fn record_approval(&self, record: &ApprovalRecord, now: DateTime<Utc>) -> Result<()> {
        if record.required_approvals == 0 {
            return Err(SchedulerError::InvalidScheduleConfig(
                "required_approvals must be at least 1".into(),
            ));
        }
        let conn = lock_conn(&self.conn)?;
        conn.execute(
            "INSERT INTO job_approvals (job_id, required_approvals, current_approvals, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(job_id) DO UPDATE SET
                required_approvals = excluded.required_approvals,
                current_approvals  = excluded.current_approvals,
                status             = excluded.status,
                updated_at         = excluded.updated_at",
            params![
                record.job_id.to_string(),
                record.required_approvals,
                record.current_approvals,
                record.status.as_str(),
                ts(&now),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for SqliteApprovalStore {
    async fn fetch_approval(&self, job_id: &JobId) -> Result<Option<ApprovalRecord>> {
        let conn = lock_conn(&self.conn)?;
        let record = conn
            .query_row(
                "SELECT required_approvals, current_approvals, status
                 FROM job_approvals WHERE job_id = ?1",
                [job_id.to_string()],
                |row| {
                    Ok(ApprovalRecord {
                        job_id: *job_id,
                        required_approvals: row.get(0)?,
                        current_approvals: row.get(1)?,
                        status: row
                            .get::<_, String>(2)?
                            .parse()
                            .map_err(|e: String| conversion_err(2, e))?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

/// Process-local approval records, for tests and embedding.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    records: RwLock<HashMap<JobId, ApprovalRecord>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ApprovalRecord) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.job_id, record);
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn fetch_approval(&self, job_id: &JobId) -> Result<Option<ApprovalRecord>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(requires_approval: bool) -> Job {
        let mut job = Job::new("patch servers", serde_json::json!({"action": "apt-upgrade"}));
        job.requires_approval = requires_approval;
        job
    }

    fn record(job: &Job, required: u32, current: u32, status: ApprovalStatus) -> ApprovalRecord {
        ApprovalRecord {
            job_id: job.id,
            required_approvals: required,
            current_approvals: current,
            status,
        }
    }

    #[tokio::test]
    async fn jobs_without_approval_flag_pass() {
        let gate = ApprovalGate::new(Arc::new(InMemoryApprovalStore::new()));
        assert!(gate.is_approved(&job(false)).await.unwrap());
    }

    #[tokio::test]
    async fn missing_record_fails_closed() {
        let gate = ApprovalGate::new(Arc::new(InMemoryApprovalStore::new()));
        assert!(!gate.is_approved(&job(true)).await.unwrap());
    }

    #[tokio::test]
    async fn quorum_and_status_both_required() {
        let store = Arc::new(InMemoryApprovalStore::new());
        let gate = ApprovalGate::new(store.clone());
        let j = job(true);

        store.insert(record(&j, 2, 1, ApprovalStatus::Pending));
        assert!(!gate.is_approved(&j).await.unwrap());

        store.insert(record(&j, 2, 2, ApprovalStatus::Pending));
        assert!(!gate.is_approved(&j).await.unwrap());

        store.insert(record(&j, 2, 2, ApprovalStatus::Approved));
        assert!(gate.is_approved(&j).await.unwrap());

        store.insert(record(&j, 2, 3, ApprovalStatus::Rejected));
        match gate.check(&j).await.unwrap() {
            GateDecision::Blocked { reason } => assert!(reason.contains("rejected")),
            GateDecision::Open => panic!("rejected approval must block"),
        }
    }

    #[tokio::test]
    async fn sqlite_store_upserts() {
        let schedules = ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let approvals = SqliteApprovalStore::new(&schedules);
        let j = job(true);
        let now = Utc::now();

        assert_eq!(approvals.fetch_approval(&j.id).await.unwrap(), None);
        approvals
            .record_approval(&record(&j, 2, 1, ApprovalStatus::Pending), now)
            .unwrap();
        approvals
            .record_approval(&record(&j, 2, 2, ApprovalStatus::Approved), now)
            .unwrap();
        let fetched = approvals.fetch_approval(&j.id).await.unwrap().unwrap();
        assert!(fetched.is_approved());
    }
}
