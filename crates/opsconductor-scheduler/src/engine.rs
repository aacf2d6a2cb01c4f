use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsconductor_core::{ExecutionId, JobId, ScheduleId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};

/// Everything the execution engine needs to run one firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub execution_id: ExecutionId,
    pub execution_serial: String,
    pub schedule_id: ScheduleId,
    pub job_id: JobId,
    pub scheduled_at: DateTime<Utc>,
    pub targets: Vec<String>,
    pub action_config: serde_json::Value,
    pub timeout_secs: Option<u64>,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

/// The engine's answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued for execution. `reference` is the engine's own job-execution id.
    Accepted { reference: Option<String> },
    /// Refused outright; the engine will not run it.
    Rejected { reason: String },
}

/// The external execution engine. Lifecycle callbacks come back through
/// [`crate::tracker::ExecutionTracker`].
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Hand off one execution. An `Err` is a transport failure; a refusal
    /// is `Ok(SubmitOutcome::Rejected)`.
    async fn submit(&self, request: &ExecutionRequest) -> Result<SubmitOutcome>;
}

/// Submits executions to an HTTP engine: `POST {base_url}/executions`.
///
/// 2xx accepts (the response's `id` becomes the reference), 4xx rejects,
/// anything else is an engine error.
pub struct HttpExecutionEngine {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcceptedBody {
    #[serde(alias = "execution_id")]
    id: Option<serde_json::Value>,
}

impl HttpExecutionEngine {
    pub fn new(base_url: &str, token: Option<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SchedulerError::Engine(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl ExecutionEngine for HttpExecutionEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, request: &ExecutionRequest) -> Result<SubmitOutcome> {
        let url = format!("{}/executions", self.base_url);
        debug!(execution_id = %request.execution_id, %url, "submitting execution");

        let resp = self
            .apply_auth(self.client.post(&url))
            .json(request)
            .send()
            .await
            .map_err(|e| SchedulerError::Engine(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            // An empty or non-JSON body still counts as accepted.
            let reference = resp
                .json::<AcceptedBody>()
                .await
                .ok()
                .and_then(|b| b.id)
                .map(|id| match id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                });
            return Ok(SubmitOutcome::Accepted { reference });
        }

        let text = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            warn!(status = status.as_u16(), body = %text, "engine rejected execution");
            return Ok(SubmitOutcome::Rejected {
                reason: format!("{}: {}", status.as_u16(), text),
            });
        }
        Err(SchedulerError::Engine(format!("{}: {}", status.as_u16(), text)))
    }
}

/// Forwards requests to an in-process worker over a bounded channel.
///
/// Never blocks the dispatch loop: a full queue is a rejection, a closed
/// one an engine error.
pub struct ChannelEngine {
    tx: mpsc::Sender<ExecutionRequest>,
}

impl ChannelEngine {
    pub fn new(tx: mpsc::Sender<ExecutionRequest>) -> Self {
        Self { tx }
    }

    /// Engine plus the receiving end for the worker task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ExecutionRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl ExecutionEngine for ChannelEngine {
    fn name(&self) -> &str {
        "channel"
    }

    async fn submit(&self, request: &ExecutionRequest) -> Result<SubmitOutcome> {
        match self.tx.try_send(request.clone()) {
            Ok(()) => Ok(SubmitOutcome::Accepted { reference: None }),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(SubmitOutcome::Rejected {
                reason: "execution queue full".into(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SchedulerError::Engine("execution queue closed".into()))
            }
        }
    }
}
