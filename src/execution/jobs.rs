//! Long-running jobs delegated to an external scheduler.
//!
//! The scheduler is a collaborator reached through submit/poll/cancel; this
//! crate never runs the job itself.

use crate::execution::runner::{Invocation, ToolRunner};
use crate::types::{Error, JobId, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct JobSubmission {
    pub job_type: String,
    pub tool: String,
    pub params: Map<String, Value>,
    pub host: Option<String>,
    pub trace_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded {
        #[serde(default)]
        output: Value,
    },
    Failed {
        #[serde(default)]
        error: String,
    },
    Cancelled,
}

#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn submit(&self, job: JobSubmission) -> Result<JobId>;
    async fn poll(&self, id: &JobId) -> Result<JobStatus>;
    async fn cancel(&self, id: &JobId) -> Result<()>;
}

pub type SharedScheduler = Arc<dyn JobScheduler>;

/// Submits, then polls until the job settles or the token fires.
pub struct JobRunner {
    scheduler: SharedScheduler,
    poll_interval: Duration,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    pub fn new(scheduler: SharedScheduler, poll_interval: Duration) -> Self {
        Self {
            scheduler,
            poll_interval,
        }
    }
}

#[async_trait]
impl ToolRunner for JobRunner {
    async fn run(&self, invocation: &Invocation, cancel: CancellationToken) -> Result<Value> {
        let id = self
            .scheduler
            .submit(JobSubmission {
                job_type: invocation.tool.entrypoint.clone(),
                tool: invocation.tool.name.clone(),
                params: invocation.params.clone(),
                host: invocation.host().map(str::to_string),
                trace_id: invocation.trace_id.to_string(),
            })
            .await?;
        tracing::info!(job_id = %id, tool = %invocation.tool.name, "job submitted");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    if let Err(err) = self.scheduler.cancel(&id).await {
                        tracing::warn!(job_id = %id, error = %err, "job cancel request failed");
                    }
                    return Err(Error::cancelled(format!("job {} cancelled", id)));
                }
            }
            match self.scheduler.poll(&id).await? {
                JobStatus::Pending | JobStatus::Running => continue,
                JobStatus::Succeeded { output } => return Ok(output),
                JobStatus::Failed { error } => {
                    return Err(Error::upstream(format!("job {} failed: {}", id, error)))
                }
                JobStatus::Cancelled => {
                    return Err(Error::cancelled(format!("job {} cancelled by scheduler", id)))
                }
            }
        }
    }
}

/// `POST /jobs`, `GET /jobs/{id}`, `POST /jobs/{id}/cancel`.
#[derive(Debug, Clone)]
pub struct HttpJobScheduler {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct Submitted {
    id: String,
}

impl HttpJobScheduler {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("scheduler client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

fn check(status: reqwest::StatusCode, what: &str) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Err(Error::not_found(format!("{}: job not found", what)))
    } else {
        Err(Error::upstream(format!("{}: scheduler returned {}", what, status)))
    }
}

#[async_trait]
impl JobScheduler for HttpJobScheduler {
    async fn submit(&self, job: JobSubmission) -> Result<JobId> {
        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(&job)
            .send()
            .await?;
        check(response.status(), "submit")?;
        let submitted: Submitted = response.json().await?;
        JobId::from_string(submitted.id).map_err(Error::upstream)
    }

    async fn poll(&self, id: &JobId) -> Result<JobStatus> {
        let response = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, id))
            .send()
            .await?;
        check(response.status(), "poll")?;
        Ok(response.json().await?)
    }

    async fn cancel(&self, id: &JobId) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/jobs/{}/cancel", self.base_url, id))
            .send()
            .await?;
        check(response.status(), "cancel")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::tests::sample_tool;
    use crate::execution::runner::tests::invocation;
    use mockall::mock;
    use mockall::predicate::always;
    use serde_json::json;

    mock! {
        Scheduler {}

        #[async_trait]
        impl JobScheduler for Scheduler {
            async fn submit(&self, job: JobSubmission) -> Result<JobId>;
            async fn poll(&self, id: &JobId) -> Result<JobStatus>;
            async fn cancel(&self, id: &JobId) -> Result<()>;
        }
    }

    fn job_id() -> JobId {
        JobId::from_string("job-1".into()).unwrap()
    }

    #[tokio::test]
    async fn test_polls_until_success() {
        let mut scheduler = MockScheduler::new();
        scheduler.expect_submit().returning(|_| Ok(job_id()));
        let mut polls = 0;
        scheduler.expect_poll().with(always()).returning(move |_| {
            polls += 1;
            if polls < 3 {
                Ok(JobStatus::Running)
            } else {
                Ok(JobStatus::Succeeded {
                    output: json!({"rows": 3}),
                })
            }
        });
        scheduler.expect_cancel().never();

        let runner = JobRunner::new(Arc::new(scheduler), Duration::from_millis(1));
        let out = runner
            .run(&invocation(sample_tool(), json!({})), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"rows": 3}));
    }

    #[tokio::test]
    async fn test_cancellation_cancels_job() {
        let mut scheduler = MockScheduler::new();
        scheduler.expect_submit().returning(|_| Ok(job_id()));
        scheduler.expect_poll().returning(|_| Ok(JobStatus::Running));
        scheduler.expect_cancel().times(1).returning(|_| Ok(()));

        let runner = JobRunner::new(Arc::new(scheduler), Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel();
        let err = runner
            .run(&invocation(sample_tool(), json!({})), token)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "cancelled");
    }

    #[tokio::test]
    async fn test_failed_job_is_error() {
        let mut scheduler = MockScheduler::new();
        scheduler.expect_submit().returning(|_| Ok(job_id()));
        scheduler.expect_poll().returning(|_| {
            Ok(JobStatus::Failed {
                error: "disk full".into(),
            })
        });

        let runner = JobRunner::new(Arc::new(scheduler), Duration::from_millis(1));
        let err = runner
            .run(&invocation(sample_tool(), json!({})), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_status_wire_format() {
        let status: JobStatus =
            serde_json::from_value(json!({"status": "succeeded", "output": "ok"})).unwrap();
        assert_eq!(status, JobStatus::Succeeded { output: json!("ok") });
        let status: JobStatus = serde_json::from_value(json!({"status": "running"})).unwrap();
        assert_eq!(status, JobStatus::Running);
    }
}
