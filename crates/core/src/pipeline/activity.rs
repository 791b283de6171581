//! The unit of executable work inside a pipeline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::ActivityError;

/// Named values an activity writes into the ticket context.
pub type Outputs = BTreeMap<String, Value>;

/// Everything an activity invocation can see.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub ticket_id: String,
    pub node_id: String,
    pub node_name: String,
    /// Node version; bumped on every retry.
    pub version: u32,
    /// Opaque activity body from the pipeline definition.
    pub params: Value,
    /// Declared reads, resolved from the ticket context.
    pub inputs: BTreeMap<String, Value>,
    /// State returned by the last `Pending` outcome.
    pub poll_state: Option<Value>,
}

impl ActivityContext {
    /// A declared input, or `MissingContext` if no earlier node wrote it.
    pub fn input(&self, key: &str) -> Result<&Value, ActivityError> {
        self.inputs
            .get(key)
            .ok_or_else(|| ActivityError::MissingContext(key.to_string()))
    }
}

/// Result of one `execute` or `poll` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Succeeded { outputs: Outputs },
    Failed { message: String },
    /// Still running remotely; `poll` is called again after the poll interval.
    Pending {
        poll_state: Value,
        partial_outputs: Outputs,
    },
}

impl ActivityOutcome {
    pub fn success() -> Self {
        ActivityOutcome::Succeeded {
            outputs: Outputs::new(),
        }
    }

    pub fn success_with(key: impl Into<String>, value: Value) -> Self {
        let mut outputs = Outputs::new();
        outputs.insert(key.into(), value);
        ActivityOutcome::Succeeded { outputs }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ActivityOutcome::Failed {
            message: message.into(),
        }
    }

    pub fn pending(poll_state: Value) -> Self {
        ActivityOutcome::Pending {
            poll_state,
            partial_outputs: Outputs::new(),
        }
    }
}

/// A registered kind of pipeline step.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    /// Whether this activity changes cluster state and must hold the cluster mutex.
    fn mutates_cluster(&self) -> bool {
        false
    }

    /// Fire the unit of work.
    async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityOutcome, ActivityError>;

    /// Check on work that `execute` left pending.
    async fn poll(&self, ctx: &ActivityContext) -> Result<ActivityOutcome, ActivityError> {
        Err(ActivityError::InvalidParams(format!(
            "activity {} does not support polling (node {})",
            self.name(),
            ctx.node_name
        )))
    }
}

/// Cluster identities a node targets, read from `cluster_id` / `cluster_ids` in its params.
pub fn cluster_targets(params: &Value) -> Vec<String> {
    let mut targets: Vec<String> = match params.get("cluster_ids") {
        Some(Value::Array(ids)) => ids
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    match params.get("cluster_id") {
        Some(Value::String(s)) => targets.push(s.clone()),
        Some(Value::Number(n)) => targets.push(n.to_string()),
        _ => {}
    }

    targets.sort();
    targets.dedup();
    targets
}

/// Activities by name. Built once at startup, then shared read-only.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, activity: Arc<dyn Activity>) -> Self {
        self.activities
            .insert(activity.name().to_string(), activity);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.activities.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl Activity for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _ctx: &ActivityContext) -> Result<ActivityOutcome, ActivityError> {
            Ok(ActivityOutcome::success())
        }
    }

    fn context(inputs: BTreeMap<String, Value>) -> ActivityContext {
        ActivityContext {
            ticket_id: "t-1".to_string(),
            node_id: "n-1".to_string(),
            node_name: "step".to_string(),
            version: 0,
            params: json!({}),
            inputs,
            poll_state: None,
        }
    }

    #[test]
    fn test_cluster_targets() {
        assert_eq!(cluster_targets(&json!({"cluster_id": "c-1"})), vec!["c-1"]);
        assert_eq!(
            cluster_targets(&json!({"cluster_ids": ["c-2", 7, "c-2"], "cluster_id": "c-1"})),
            vec!["7", "c-1", "c-2"]
        );
        assert!(cluster_targets(&json!({"hosts": []})).is_empty());
    }

    #[test]
    fn test_input_missing() {
        let ctx = context(BTreeMap::new());
        assert_eq!(
            ctx.input("hosts"),
            Err(ActivityError::MissingContext("hosts".to_string()))
        );
    }

    #[tokio::test]
    async fn test_registry_and_default_poll() {
        let registry = ActivityRegistry::new().register(Arc::new(Noop));
        assert!(registry.contains("noop"));
        assert_eq!(registry.names(), vec!["noop".to_string()]);

        let activity = registry.get("noop").unwrap();
        assert!(!activity.mutates_cluster());
        let ctx = context(BTreeMap::new());
        assert_eq!(
            activity.execute(&ctx).await.unwrap(),
            ActivityOutcome::success()
        );
        assert!(matches!(
            activity.poll(&ctx).await,
            Err(ActivityError::InvalidParams(_))
        ));
    }
}
