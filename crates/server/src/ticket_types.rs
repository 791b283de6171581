//! Ticket types served by the `dbflow` binary.
//!
//! Both types turn `details.steps` into a pipeline of agent jobs. Each entry is
//! either one step or an array of steps run in parallel:
//!
//! ```json
//! {
//!   "cluster_id": "c-1",
//!   "steps": [
//!     {"name": "stop-proxy", "body": {"cmd": "proxy stop"}},
//!     [
//!       {"name": "restart-a", "body": {"cmd": "restart", "host": "a"}},
//!       {"name": "restart-b", "body": {"cmd": "restart", "host": "b"}}
//!     ],
//!     {"name": "verify", "body": {"cmd": "health"}, "check": true}
//!   ]
//! }
//! ```
//!
//! Step bodies are opaque here; only the agent interprets them.

use serde_json::{json, Value};

use dbflow_core::{
    flow::HOSTS_KEY,
    pipeline::{ActivityStep, Pipeline, PipelineBuilder, PipelineError},
    registry::RegistryError,
    FlowTemplate, FlowType, TicketTypeDefinition, TicketTypeRegistry,
};

/// Mutating step, holds the cluster mutex.
pub const REMOTE_JOB: &str = "remote_job";
/// Read-only step.
pub const REMOTE_CHECK: &str = "remote_check";

/// Registry with `cluster_apply` and `cluster_restart`.
pub fn builtin_registry() -> Result<TicketTypeRegistry, RegistryError> {
    TicketTypeRegistry::new()
        .register(cluster_apply())?
        .register(cluster_restart())
}

fn cluster_apply() -> TicketTypeDefinition {
    TicketTypeDefinition::new("cluster_apply")
        .describe("Allocate hosts and run a change against a new or existing cluster")
        .flow(FlowTemplate::new(FlowType::Approval, "change approval"))
        .flow(FlowTemplate::new(FlowType::Pause, "operator confirmation"))
        .flow(FlowTemplate::new(FlowType::ResourceApply, "allocate hosts"))
        .flow(FlowTemplate::new(FlowType::Inner, "apply change"))
        .flow(FlowTemplate::new(FlowType::Delivery, "deliver"))
        .with_validator(validate_steps)
        .with_pipeline(|builder| build_steps(builder, true))
}

fn cluster_restart() -> TicketTypeDefinition {
    TicketTypeDefinition::new("cluster_restart")
        .describe("Restart the instances of an existing cluster")
        .flow(FlowTemplate::new(FlowType::Approval, "change approval"))
        .flow(FlowTemplate::new(FlowType::Inner, "restart"))
        .flow(FlowTemplate::new(FlowType::Delivery, "deliver"))
        .with_validator(validate_steps)
        .with_pipeline(|builder| build_steps(builder, false))
}

fn validate_steps(details: &Value) -> Result<(), String> {
    match details.get("cluster_id") {
        Some(Value::String(id)) if !id.is_empty() => {}
        Some(Value::Number(_)) => {}
        _ => return Err("cluster_id is required".to_string()),
    }

    let steps = details
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| "steps must be an array".to_string())?;
    if steps.is_empty() {
        return Err("steps must not be empty".to_string());
    }

    for (i, entry) in steps.iter().enumerate() {
        match entry {
            Value::Array(group) if group.is_empty() => {
                return Err(format!("steps[{}]: parallel group is empty", i));
            }
            Value::Array(group) => {
                for step in group {
                    check_step(step).map_err(|e| format!("steps[{}]: {}", i, e))?;
                }
            }
            step => check_step(step).map_err(|e| format!("steps[{}]: {}", i, e))?,
        }
    }
    Ok(())
}

fn check_step(step: &Value) -> Result<(), String> {
    match step.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => {}
        _ => return Err("step name is required".to_string()),
    }
    if !step.get("body").is_some_and(Value::is_object) {
        return Err("step body must be an object".to_string());
    }
    Ok(())
}

/// Translate `details.steps` into builder calls. With `needs_hosts`, every step
/// also reads the hosts written by the resource flow.
fn build_steps(builder: PipelineBuilder, needs_hosts: bool) -> Result<Pipeline, PipelineError> {
    let details = builder.context().details.clone();
    let cluster_id = details.get("cluster_id").cloned().unwrap_or(Value::Null);
    let steps = details
        .get("steps")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let step = |raw: &Value| {
        let name = raw.get("name").and_then(Value::as_str).unwrap_or("step");
        let activity = if raw.get("check").and_then(Value::as_bool).unwrap_or(false) {
            REMOTE_CHECK
        } else {
            REMOTE_JOB
        };
        let params = json!({
            "cluster_id": cluster_id,
            "body": raw.get("body").cloned().unwrap_or_else(|| json!({})),
        });
        let step = ActivityStep::new(name, activity, params);
        if needs_hosts {
            step.reads([HOSTS_KEY])
        } else {
            step
        }
    };

    let mut builder = builder;
    for entry in &steps {
        builder = match entry {
            Value::Array(group) => builder.add_parallel_activities(group.iter().map(step)),
            single => builder.add_step(step(single)),
        };
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbflow_core::pipeline::{NodeSpec, TicketContext};

    fn details() -> Value {
        json!({
            "cluster_id": "c-1",
            "steps": [
                {"name": "stop-proxy", "body": {"cmd": "proxy stop"}},
                [
                    {"name": "restart-a", "body": {"host": "a"}},
                    {"name": "restart-b", "body": {"host": "b"}}
                ],
                {"name": "verify", "body": {"cmd": "health"}, "check": true}
            ]
        })
    }

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.names(), vec!["cluster_apply", "cluster_restart"]);

        let apply = registry.get("cluster_apply").unwrap();
        let types: Vec<FlowType> = apply.flows.iter().map(|f| f.flow_type).collect();
        assert_eq!(
            types,
            vec![
                FlowType::Approval,
                FlowType::Pause,
                FlowType::ResourceApply,
                FlowType::Inner,
                FlowType::Delivery,
            ]
        );
        assert_eq!(registry.get("cluster_restart").unwrap().flows.len(), 3);
    }

    #[test]
    fn test_validate_steps() {
        assert!(validate_steps(&details()).is_ok());

        let err = validate_steps(&json!({"steps": []})).unwrap_err();
        assert_eq!(err, "cluster_id is required");

        let err = validate_steps(&json!({"cluster_id": "c-1", "steps": []})).unwrap_err();
        assert_eq!(err, "steps must not be empty");

        let err = validate_steps(&json!({
            "cluster_id": "c-1",
            "steps": [{"name": "a", "body": {}}, [{"name": "b"}]]
        }))
        .unwrap_err();
        assert_eq!(err, "steps[1]: step body must be an object");
    }

    #[test]
    fn test_restart_pipeline_shape() {
        let registry = builtin_registry().unwrap();
        let definition = registry.get("cluster_restart").unwrap();
        let pipeline = definition
            .build_pipeline(PipelineBuilder::new(TicketContext::new("t-1", details())))
            .unwrap();
        pipeline.ensure_resolved().unwrap();

        let steps = pipeline.root.steps();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["stop-proxy", "restart-a", "restart-b", "verify"]);
        assert_eq!(steps[0].activity, REMOTE_JOB);
        assert_eq!(steps[3].activity, REMOTE_CHECK);
        assert_eq!(steps[1].params["cluster_id"], json!("c-1"));
        assert_eq!(steps[1].params["body"], json!({"host": "a"}));

        let NodeSpec::Sequence { children, .. } = &pipeline.root else {
            panic!("root should be a sequence");
        };
        assert!(matches!(children[1], NodeSpec::Parallel { .. }));
    }

    #[test]
    fn test_apply_pipeline_reads_hosts() {
        let registry = builtin_registry().unwrap();
        let definition = registry.get("cluster_apply").unwrap();

        let pipeline = definition
            .build_pipeline(PipelineBuilder::new(TicketContext::new("t-1", details())))
            .unwrap();
        assert!(pipeline.ensure_resolved().is_err());

        let context = TicketContext::new("t-1", details()).with_keys([HOSTS_KEY]);
        let pipeline = definition
            .build_pipeline(PipelineBuilder::new(context))
            .unwrap();
        pipeline.ensure_resolved().unwrap();
    }
}
