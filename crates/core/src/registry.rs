//! Ticket type registration table.
//!
//! Built once at startup and shared read-only: each ticket type maps to its
//! flow chain, a details validator and, for types with an inner flow, the
//! function that builds its pipeline.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::{Pipeline, PipelineBuilder, PipelineError};
use crate::ticket::{FlowType, NewFlow, RetryPolicy};

/// Checks a ticket's details; the error message is returned to the submitter.
pub type DetailsValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Builds a ticket's pipeline from a builder seeded with its context.
pub type PipelineFactory =
    Arc<dyn Fn(PipelineBuilder) -> Result<Pipeline, PipelineError> + Send + Sync>;

/// One flow of a ticket type's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTemplate {
    pub flow_type: FlowType,
    pub alias: String,
    /// Copied onto the flow (operators, messages, resource spec...).
    #[serde(default)]
    pub details: Value,
}

impl FlowTemplate {
    pub fn new(flow_type: FlowType, alias: impl Into<String>) -> Self {
        Self {
            flow_type,
            alias: alias.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn to_new_flow(&self) -> NewFlow {
        NewFlow {
            flow_type: self.flow_type,
            alias: self.alias.clone(),
            details: self.details.clone(),
        }
    }
}

/// Everything the manager needs to know about one ticket type.
#[derive(Clone)]
pub struct TicketTypeDefinition {
    pub name: String,
    pub description: String,
    pub flows: Vec<FlowTemplate>,
    /// Policy used when the submitter does not pick one.
    pub default_retry_policy: RetryPolicy,
    validator: Option<DetailsValidator>,
    pipeline: Option<PipelineFactory>,
}

impl fmt::Debug for TicketTypeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketTypeDefinition")
            .field("name", &self.name)
            .field("flows", &self.flows)
            .field("default_retry_policy", &self.default_retry_policy)
            .field("has_validator", &self.validator.is_some())
            .field("has_pipeline", &self.pipeline.is_some())
            .finish()
    }
}

impl TicketTypeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            flows: Vec::new(),
            default_retry_policy: RetryPolicy::default(),
            validator: None,
            pipeline: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn flow(mut self, template: FlowTemplate) -> Self {
        self.flows.push(template);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_pipeline<F>(mut self, factory: F) -> Self
    where
        F: Fn(PipelineBuilder) -> Result<Pipeline, PipelineError> + Send + Sync + 'static,
    {
        self.pipeline = Some(Arc::new(factory));
        self
    }

    /// Check submitted details. Details must be a JSON object.
    pub fn validate(&self, details: &Value) -> Result<(), String> {
        if !details.is_object() {
            return Err("details must be a JSON object".to_string());
        }
        match &self.validator {
            Some(validator) => validator(details),
            None => Ok(()),
        }
    }

    /// Build this type's pipeline.
    pub fn build_pipeline(&self, builder: PipelineBuilder) -> Result<Pipeline, PipelineError> {
        match &self.pipeline {
            Some(factory) => factory(builder),
            None => Err(PipelineError::Empty(format!(
                "ticket type {} defines no pipeline",
                self.name
            ))),
        }
    }

    /// Structural problems: no flows, or an inner flow without a pipeline.
    fn check(&self) -> Result<(), RegistryError> {
        if self.flows.is_empty() {
            return Err(RegistryError::NoFlows(self.name.clone()));
        }
        let has_inner = self.flows.iter().any(|f| f.flow_type == FlowType::Inner);
        if has_inner && self.pipeline.is_none() {
            return Err(RegistryError::MissingPipeline(self.name.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("ticket type {0} registered twice")]
    Duplicate(String),

    #[error("ticket type {0} has no flows")]
    NoFlows(String),

    #[error("ticket type {0} has an inner flow but no pipeline")]
    MissingPipeline(String),
}

/// Immutable table of ticket types.
#[derive(Debug, Clone, Default)]
pub struct TicketTypeRegistry {
    types: HashMap<String, Arc<TicketTypeDefinition>>,
}

impl TicketTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, definition: TicketTypeDefinition) -> Result<Self, RegistryError> {
        definition.check()?;
        if self.types.contains_key(&definition.name) {
            return Err(RegistryError::Duplicate(definition.name));
        }
        self.types
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TicketTypeDefinition>> {
        self.types.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<Arc<TicketTypeDefinition>> {
        let mut defs: Vec<_> = self.types.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TicketContext;
    use serde_json::json;

    fn restart_type() -> TicketTypeDefinition {
        TicketTypeDefinition::new("restart")
            .flow(FlowTemplate::new(FlowType::Inner, "restart"))
            .flow(FlowTemplate::new(FlowType::Delivery, "delivery"))
            .with_validator(|details| match details.get("cluster") {
                Some(Value::String(_)) => Ok(()),
                _ => Err("cluster is required".to_string()),
            })
            .with_pipeline(|builder| {
                let cluster = builder.context().details["cluster"].clone();
                builder
                    .add_activity("restart", "remote_job", json!({"cluster": cluster}))
                    .build()
            })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = TicketTypeRegistry::new().register(restart_type()).unwrap();
        assert!(registry.contains("restart"));
        assert_eq!(registry.names(), vec!["restart"]);

        let def = registry.get("restart").unwrap();
        assert_eq!(def.flows.len(), 2);
        assert_eq!(def.default_retry_policy, RetryPolicy::Manual);
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = TicketTypeRegistry::new()
            .register(restart_type())
            .unwrap()
            .register(restart_type())
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("restart".to_string()));
    }

    #[test]
    fn test_inner_flow_requires_pipeline() {
        let def = TicketTypeDefinition::new("broken").flow(FlowTemplate::new(FlowType::Inner, "run"));
        assert_eq!(
            TicketTypeRegistry::new().register(def).unwrap_err(),
            RegistryError::MissingPipeline("broken".to_string())
        );

        let def = TicketTypeDefinition::new("empty");
        assert_eq!(
            TicketTypeRegistry::new().register(def).unwrap_err(),
            RegistryError::NoFlows("empty".to_string())
        );
    }

    #[test]
    fn test_validate_details() {
        let def = restart_type();
        assert!(def.validate(&json!({"cluster": "c-1"})).is_ok());
        assert_eq!(
            def.validate(&json!({})).unwrap_err(),
            "cluster is required"
        );
        assert!(def.validate(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_build_pipeline_from_details() {
        let def = restart_type();
        let builder = PipelineBuilder::new(TicketContext::new("t-1", json!({"cluster": "c-9"})));
        let pipeline = def.build_pipeline(builder).unwrap();
        let steps = pipeline.root.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].params["cluster"], "c-9");
    }

    #[test]
    fn test_flow_template_to_new_flow() {
        let template = FlowTemplate::new(FlowType::Pause, "confirm")
            .with_details(json!({"operators": ["alice"]}));
        let flow = template.to_new_flow();
        assert_eq!(flow.flow_type, FlowType::Pause);
        assert_eq!(flow.alias, "confirm");
        assert_eq!(flow.details["operators"][0], "alice");
    }
}
