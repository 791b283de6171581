//! Mock job agent for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::external::{ExternalError, JobAgent, JobStatus};

/// Mock implementation of the JobAgent trait.
///
/// Each job reports `done = false` for the configured number of polls, then
/// finishes with the configured success flag and output.
#[derive(Debug)]
pub struct MockJobAgent {
    pending_polls: u32,
    success: bool,
    output: Value,
    unavailable: Mutex<bool>,
    submitted: Mutex<Vec<Value>>,
    polls: Mutex<HashMap<String, u32>>,
}

impl Default for MockJobAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJobAgent {
    pub fn new() -> Self {
        Self {
            pending_polls: 0,
            success: true,
            output: Value::Object(Default::default()),
            unavailable: Mutex::new(false),
            submitted: Mutex::new(Vec::new()),
            polls: Mutex::new(HashMap::new()),
        }
    }

    /// Polls answered with `done = false` before a job finishes.
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    /// Jobs finish unsuccessfully.
    pub fn failing(mut self) -> Self {
        self.success = false;
        self
    }

    /// Fail every call with a connection-style error.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    /// Job bodies submitted so far.
    pub fn submitted(&self) -> Vec<Value> {
        self.submitted.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), ExternalError> {
        if *self.unavailable.lock().unwrap() {
            return Err(ExternalError::ApiError {
                status: 502,
                message: "agent unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl JobAgent for MockJobAgent {
    async fn submit_job(&self, body: &Value) -> Result<String, ExternalError> {
        self.check_available()?;
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(body.clone());
        Ok(format!("job-{}", submitted.len()))
    }

    async fn poll_job(&self, job_id: &str) -> Result<JobStatus, ExternalError> {
        self.check_available()?;
        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(job_id.to_string()).or_insert(0);
        *count += 1;

        if *count <= self.pending_polls {
            return Ok(JobStatus {
                done: false,
                success: false,
                output: Value::Null,
            });
        }
        Ok(JobStatus {
            done: true,
            success: self.success,
            output: self.output.clone(),
        })
    }
}
