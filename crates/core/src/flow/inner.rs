use std::sync::Arc;

use async_trait::async_trait;

use super::{FlowError, FlowRunner, FlowState};
use crate::pipeline::{
    ContextStore, NodeStatus, PipelineBuilder, PipelineEngine, TicketContext,
};
use crate::registry::TicketTypeRegistry;
use crate::ticket::{Flow, FlowType, Ticket, TicketStatus};

/// Builds the ticket type's pipeline and runs it on the engine.
///
/// The flow's status is a projection of the pipeline root: READY and RUNNING
/// both read as RUNNING.
pub struct InnerFlow {
    engine: PipelineEngine,
    registry: Arc<TicketTypeRegistry>,
    context: Arc<dyn ContextStore>,
}

impl InnerFlow {
    pub fn new(
        engine: PipelineEngine,
        registry: Arc<TicketTypeRegistry>,
        context: Arc<dyn ContextStore>,
    ) -> Self {
        Self {
            engine,
            registry,
            context,
        }
    }

    fn failure_message(&self, pipeline_id: &str) -> Result<String, FlowError> {
        let message = match self.engine.failing_node(pipeline_id)? {
            Some(node) => format!(
                "node {} failed: {}",
                node.name,
                node.error.as_deref().unwrap_or("unknown error")
            ),
            None => "pipeline failed".to_string(),
        };
        Ok(message)
    }
}

#[async_trait]
impl FlowRunner for InnerFlow {
    fn flow_type(&self) -> FlowType {
        FlowType::Inner
    }

    async fn run(&self, ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError> {
        let definition = self
            .registry
            .get(&ticket.ticket_type)
            .ok_or_else(|| FlowError::UnknownTicketType(ticket.ticket_type.clone()))?;

        // Keys written by earlier flows (e.g. allocated hosts) satisfy reads.
        let written = self.context.all(&ticket.id)?;
        let context = TicketContext::new(ticket.id.clone(), ticket.details.clone())
            .with_keys(written.into_keys());
        let builder = PipelineBuilder::new(context).with_name(flow.alias.clone());

        let pipeline = definition.build_pipeline(builder)?;
        let pipeline_id =
            self.engine
                .launch(&ticket.id, &flow.id, &pipeline, ticket.retry_policy)?;

        Ok(FlowState::running(pipeline_id.clone())
            .with_message(format!("running pipeline {}", pipeline.name)))
    }

    async fn status(&self, _ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError> {
        let pipeline_id = flow
            .flow_obj_id
            .as_deref()
            .ok_or_else(|| FlowError::MissingCorrelation(flow.id.clone()))?;

        let state = match self.engine.root_status(pipeline_id)? {
            NodeStatus::Ready | NodeStatus::Running => FlowState::new(TicketStatus::Running),
            NodeStatus::Succeeded => FlowState::succeeded(),
            NodeStatus::Failed => FlowState::failed(self.failure_message(pipeline_id)?),
        };
        Ok(state)
    }
}
