use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{flow_operators, FlowError, FlowRunner, FlowState};
use crate::external::{ResourceOutcome, ResourceRequest, ResourceService};
use crate::pipeline::ContextStore;
use crate::ticket::{Flow, FlowType, Ticket, TicketStatus};
use crate::todo::{NewTodo, TodoStatus, TodoStore, TodoType};

/// Context key holding the allocated host addresses.
pub const HOSTS_KEY: &str = "hosts";
/// Context key holding the allocation request id.
pub const REQUEST_ID_KEY: &str = "resource_request_id";

/// Acquires hosts for the ticket.
///
/// A shortage does not fail the flow: it opens a RESOURCE_REPLENISH todo and
/// stays RUNNING until an operator tops up the pool and reapplies.
pub struct ResourceApplyFlow {
    resources: Arc<dyn ResourceService>,
    todos: Arc<dyn TodoStore>,
    context: Arc<dyn ContextStore>,
}

impl ResourceApplyFlow {
    pub fn new(
        resources: Arc<dyn ResourceService>,
        todos: Arc<dyn TodoStore>,
        context: Arc<dyn ContextStore>,
    ) -> Self {
        Self {
            resources,
            todos,
            context,
        }
    }

    /// Host spec from the ticket's `resources` detail, else the flow template's `spec`.
    fn spec(ticket: &Ticket, flow: &Flow) -> Value {
        ticket
            .details
            .get("resources")
            .or_else(|| flow.details.get("spec"))
            .cloned()
            .unwrap_or_else(|| json!({}))
    }
}

#[async_trait]
impl FlowRunner for ResourceApplyFlow {
    fn flow_type(&self) -> FlowType {
        FlowType::ResourceApply
    }

    async fn run(&self, ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError> {
        let request = ResourceRequest {
            ticket_id: ticket.id.clone(),
            spec: Self::spec(ticket, flow),
        };

        match self.resources.apply_resources(&request).await? {
            ResourceOutcome::Allocated { request_id, hosts } => {
                self.context
                    .put(&ticket.id, HOSTS_KEY, &json!(hosts), &flow.id)?;
                self.context
                    .put(&ticket.id, REQUEST_ID_KEY, &json!(request_id), &flow.id)?;
                Ok(FlowState::succeeded()
                    .with_obj_id(request_id)
                    .with_message(format!("allocated {}", hosts.join(", "))))
            }
            ResourceOutcome::Shortage { message } => {
                let todo = self.todos.create(NewTodo {
                    ticket_id: ticket.id.clone(),
                    flow_id: flow.id.clone(),
                    todo_type: TodoType::ResourceReplenish,
                    operators: flow_operators(ticket, flow),
                    context: json!({
                        "ticket_id": ticket.id,
                        "flow_id": flow.id,
                        "flow_index": flow.flow_index,
                        "spec": request.spec,
                        "shortage": message,
                    }),
                })?;
                Ok(FlowState::running(todo.id.clone())
                    .with_message(format!("resource shortage: {}", message))
                    .with_todo(todo))
            }
        }
    }

    async fn status(&self, _ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError> {
        let obj_id = flow
            .flow_obj_id
            .as_deref()
            .ok_or_else(|| FlowError::MissingCorrelation(flow.id.clone()))?;

        // The correlation id is either a replenish todo or a finished allocation.
        let Some(todo) = self.todos.get(obj_id)? else {
            return Ok(FlowState::succeeded());
        };
        let state = match todo.status {
            TodoStatus::Todo => FlowState::new(TicketStatus::Running),
            // Reapplied; the flow goes back to PENDING and runs again.
            TodoStatus::Done => FlowState::new(TicketStatus::Pending),
            TodoStatus::Terminated => FlowState::new(TicketStatus::Terminated),
        };
        Ok(state)
    }
}
