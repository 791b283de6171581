//! Remote execution agent and the activity that drives it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{authorize, base_url, build_client, check_status, parse_json, ExternalError, JobStatus};
use crate::config::ServiceEndpointConfig;
use crate::metrics;
use crate::pipeline::{Activity, ActivityContext, ActivityError, ActivityOutcome, Outputs};

/// Runs operational jobs on target machines.
#[async_trait]
pub trait JobAgent: Send + Sync {
    /// Submit a job body; returns the agent's job id.
    async fn submit_job(&self, body: &Value) -> Result<String, ExternalError>;

    async fn poll_job(&self, job_id: &str) -> Result<JobStatus, ExternalError>;
}

#[derive(Debug, Deserialize)]
struct SubmitJobResponse {
    job_id: String,
}

/// Job agent reached over HTTP: `POST {url}/jobs`, `GET {url}/jobs/{id}`.
pub struct HttpJobAgent {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpJobAgent {
    pub fn new(config: &ServiceEndpointConfig) -> Result<Self, ExternalError> {
        if config.url.is_empty() {
            return Err(ExternalError::NotConfigured(
                "agent url is required".to_string(),
            ));
        }

        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: base_url(&config.url),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl JobAgent for HttpJobAgent {
    async fn submit_job(&self, body: &Value) -> Result<String, ExternalError> {
        let url = format!("{}/jobs", self.base_url);

        let started = Instant::now();
        let result: Result<String, ExternalError> = async {
            let response = authorize(self.client.post(&url), self.token.as_deref())
                .json(body)
                .send()
                .await?;
            let response = check_status(response, "job").await?;
            let submitted: SubmitJobResponse = parse_json(response, "job submission").await?;
            Ok(submitted.job_id)
        }
        .await;
        metrics::observe_external("agent", "submit", started, &result);
        result
    }

    async fn poll_job(&self, job_id: &str) -> Result<JobStatus, ExternalError> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);

        let started = Instant::now();
        let result: Result<JobStatus, ExternalError> = async {
            let response = authorize(self.client.get(&url), self.token.as_deref())
                .send()
                .await?;
            let response = check_status(response, job_id).await?;
            parse_json(response, "job status").await
        }
        .await;
        metrics::observe_external("agent", "poll", started, &result);
        result
    }
}

/// Pipeline activity that submits its params as a job and polls it to completion.
///
/// The job body is the node's `body` param (or all params), together with the
/// node's resolved context inputs. A successful job's object output becomes the
/// node's outputs.
pub struct RemoteJobActivity {
    name: String,
    mutating: bool,
    agent: Arc<dyn JobAgent>,
}

impl RemoteJobActivity {
    /// `remote_job`: changes cluster state, holds the cluster mutex.
    pub fn new(agent: Arc<dyn JobAgent>) -> Self {
        Self {
            name: "remote_job".to_string(),
            mutating: true,
            agent,
        }
    }

    /// `remote_check`: read-only, never takes the mutex.
    pub fn read_only(agent: Arc<dyn JobAgent>) -> Self {
        Self {
            name: "remote_check".to_string(),
            mutating: false,
            agent,
        }
    }

    fn job_id(ctx: &ActivityContext) -> Result<&str, ActivityError> {
        ctx.poll_state
            .as_ref()
            .and_then(|s| s.get("job_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ActivityError::InvalidParams("poll state has no job_id".to_string()))
    }
}

#[async_trait]
impl Activity for RemoteJobActivity {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutates_cluster(&self) -> bool {
        self.mutating
    }

    async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityOutcome, ActivityError> {
        let body = json!({
            "ticket_id": ctx.ticket_id,
            "node": ctx.node_name,
            "body": ctx.params.get("body").unwrap_or(&ctx.params),
            "context": ctx.inputs,
        });

        let job_id = self
            .agent
            .submit_job(&body)
            .await
            .map_err(|e| ActivityError::External(e.to_string()))?;
        debug!("Node {} submitted job {}", ctx.node_name, job_id);

        Ok(ActivityOutcome::pending(json!({ "job_id": job_id })))
    }

    async fn poll(&self, ctx: &ActivityContext) -> Result<ActivityOutcome, ActivityError> {
        let job_id = Self::job_id(ctx)?;
        let status = self
            .agent
            .poll_job(job_id)
            .await
            .map_err(|e| ActivityError::External(e.to_string()))?;

        if !status.done {
            return Ok(ActivityOutcome::pending(json!({ "job_id": job_id })));
        }

        if !status.success {
            let message = status
                .output
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("job {} failed", job_id));
            return Ok(ActivityOutcome::failed(message));
        }

        let outputs: Outputs = match status.output {
            Value::Object(map) => map.into_iter().collect(),
            _ => Outputs::new(),
        };
        Ok(ActivityOutcome::Succeeded { outputs })
    }
}
