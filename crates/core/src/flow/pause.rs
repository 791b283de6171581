use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{flow_operators, FlowError, FlowRunner, FlowState};
use crate::ticket::{Flow, FlowType, Ticket, TicketStatus};
use crate::todo::{NewTodo, TodoError, TodoStatus, TodoStore, TodoType};

/// Blocks on a human confirmation todo.
///
/// `run` opens an APPROVE todo and reports RUNNING; the flow only moves on
/// when an operator resolves the todo.
pub struct PauseFlow {
    todos: Arc<dyn TodoStore>,
}

impl PauseFlow {
    pub fn new(todos: Arc<dyn TodoStore>) -> Self {
        Self { todos }
    }
}

#[async_trait]
impl FlowRunner for PauseFlow {
    fn flow_type(&self) -> FlowType {
        FlowType::Pause
    }

    async fn run(&self, ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError> {
        let todo = self.todos.create(NewTodo {
            ticket_id: ticket.id.clone(),
            flow_id: flow.id.clone(),
            todo_type: TodoType::Approve,
            operators: flow_operators(ticket, flow),
            context: json!({
                "ticket_id": ticket.id,
                "flow_id": flow.id,
                "flow_index": flow.flow_index,
                "message": flow.details.get("message").cloned().unwrap_or(Value::Null),
            }),
        })?;

        Ok(FlowState::running(todo.id.clone())
            .with_message(format!("waiting for confirmation ({})", todo.operators.join(", ")))
            .with_todo(todo))
    }

    async fn status(&self, _ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError> {
        let todo_id = flow
            .flow_obj_id
            .as_deref()
            .ok_or_else(|| FlowError::MissingCorrelation(flow.id.clone()))?;
        let todo = self
            .todos
            .get(todo_id)?
            .ok_or_else(|| TodoError::NotFound(todo_id.to_string()))?;

        let state = match todo.status {
            TodoStatus::Todo => FlowState::new(TicketStatus::Running),
            TodoStatus::Done => FlowState::succeeded().with_message(format!(
                "confirmed by {}",
                todo.resolved_by.as_deref().unwrap_or("unknown")
            )),
            TodoStatus::Terminated => FlowState::new(TicketStatus::Terminated),
        };
        Ok(state)
    }
}
