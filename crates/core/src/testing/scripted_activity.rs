//! Scripted pipeline activity for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::pipeline::{Activity, ActivityContext, ActivityError, ActivityOutcome};

/// An activity that replays queued outcomes.
///
/// `execute` and `poll` both take the next scripted outcome; once the script is
/// exhausted every call succeeds with no outputs. Every call is recorded,
/// along with how many were ever in flight together.
///
/// # Example
///
/// ```rust,ignore
/// let deploy = Arc::new(
///     ScriptedActivity::new("deploy")
///         .mutating()
///         .with_outcomes(vec![Ok(ActivityOutcome::failed("disk full"))]),
/// );
/// let registry = ActivityRegistry::new().register(deploy.clone());
/// // ... run a pipeline ...
/// assert_eq!(deploy.call_count(), 2);
/// ```
pub struct ScriptedActivity {
    name: String,
    mutating: bool,
    delay: Option<Duration>,
    script: Mutex<VecDeque<Result<ActivityOutcome, ActivityError>>>,
    calls: Mutex<Vec<ActivityContext>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    /// Calls block until the gate closes; see `open_gate`.
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedActivity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mutating: false,
            delay: None,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Take the cluster mutex like a real cluster-changing step.
    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    pub fn with_outcomes(self, outcomes: Vec<Result<ActivityOutcome, ActivityError>>) -> Self {
        self.script.lock().unwrap().extend(outcomes);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold every call until `open_gate` is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.close();
        }
    }

    pub fn push_outcome(&self, outcome: Result<ActivityOutcome, ActivityError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<ActivityContext> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Most calls ever in progress at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn next(&self, ctx: &ActivityContext) -> Result<ActivityOutcome, ActivityError> {
        self.calls.lock().unwrap().push(ctx.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let outcome = self.run_script().await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn run_script(&self) -> Result<ActivityOutcome, ActivityError> {
        if let Some(gate) = &self.gate {
            // Acquire fails once the semaphore is closed.
            let _ = gate.acquire().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(ActivityOutcome::success()))
    }
}

#[async_trait]
impl Activity for ScriptedActivity {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutates_cluster(&self) -> bool {
        self.mutating
    }

    async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityOutcome, ActivityError> {
        self.next(ctx).await
    }

    async fn poll(&self, ctx: &ActivityContext) -> Result<ActivityOutcome, ActivityError> {
        self.next(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ctx() -> ActivityContext {
        ActivityContext {
            ticket_id: "t-1".to_string(),
            node_id: "n-1".to_string(),
            node_name: "step".to_string(),
            version: 0,
            params: json!({}),
            inputs: BTreeMap::new(),
            poll_state: None,
        }
    }

    #[tokio::test]
    async fn test_script_then_default_success() {
        let activity = ScriptedActivity::new("x").with_outcomes(vec![Err(ActivityError::Failed(
            "boom".to_string(),
        ))]);
        assert!(activity.execute(&ctx()).await.is_err());
        assert_eq!(
            activity.execute(&ctx()).await.unwrap(),
            ActivityOutcome::success()
        );
        assert_eq!(activity.call_count(), 2);
    }

    #[tokio::test]
    async fn test_gate_blocks_until_opened() {
        let activity = Arc::new(ScriptedActivity::new("x").gated());
        let running = activity.clone();
        let handle = tokio::spawn(async move { running.execute(&ctx()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        activity.open_gate();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_tracks_overlapping_calls() {
        let activity = Arc::new(ScriptedActivity::new("x").with_delay(Duration::from_millis(30)));
        activity.execute(&ctx()).await.unwrap();
        assert_eq!(activity.max_concurrent(), 1);

        let (ctx_a, ctx_b) = (ctx(), ctx());
        let (a, b) = tokio::join!(activity.execute(&ctx_a), activity.execute(&ctx_b));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(activity.max_concurrent(), 2);
    }
}
