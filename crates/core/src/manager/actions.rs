//! Operations exposed to the API layer: submission, human resolution,
//! termination, retries and status queries.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::audit::{self, AuditEvent};
use crate::metrics;
use crate::ticket::{
    CreateTicketRequest, Flow, FlowPatch, FlowType, Ticket, TicketFilter, TicketStatus,
};
use crate::todo::{Todo, TodoAction, TodoError, TodoFilter, TodoStatus};

use super::runner::TicketFlowManager;
use super::types::{ManagerError, SubmitTicketRequest, TicketStatusView};

impl TicketFlowManager {
    /// Validate and persist a ticket, then start its first flow in the background.
    pub async fn submit_ticket(&self, request: SubmitTicketRequest) -> Result<Ticket, ManagerError> {
        let definition = self.registry.get(&request.ticket_type).ok_or_else(|| {
            ManagerError::Validation(format!("unknown ticket type: {}", request.ticket_type))
        })?;
        if request.tenant_id.trim().is_empty() {
            return Err(ManagerError::Validation("tenant_id is required".to_string()));
        }
        if request.created_by.trim().is_empty() {
            return Err(ManagerError::Validation("created_by is required".to_string()));
        }

        let details = match request.details {
            Value::Null => json!({}),
            details => details,
        };
        definition
            .validate(&details)
            .map_err(ManagerError::Validation)?;

        if let Some(missing) = definition
            .flows
            .iter()
            .find(|template| !self.runners.contains(template.flow_type))
        {
            return Err(ManagerError::Validation(format!(
                "ticket type {} needs a {} flow, which this deployment cannot run",
                definition.name, missing.flow_type
            )));
        }

        let ticket = self.tickets.create(CreateTicketRequest {
            ticket_type: definition.name.clone(),
            tenant_id: request.tenant_id,
            created_by: request.created_by,
            retry_policy: request
                .retry_policy
                .unwrap_or(definition.default_retry_policy),
            details,
            flows: definition.flows.iter().map(|t| t.to_new_flow()).collect(),
        })?;

        info!(
            "Submitted ticket {} ({}) for tenant {} by {}",
            ticket.id, ticket.ticket_type, ticket.tenant_id, ticket.created_by
        );
        metrics::TICKETS_SUBMITTED
            .with_label_values(&[ticket.ticket_type.as_str()])
            .inc();
        audit::emit(
            &self.audit,
            AuditEvent::TicketCreated {
                ticket_id: ticket.id.clone(),
                ticket_type: ticket.ticket_type.clone(),
                tenant_id: ticket.tenant_id.clone(),
                created_by: ticket.created_by.clone(),
                flow_count: definition.flows.len(),
            },
        )
        .await;

        self.spawn_advance(ticket.id.clone());
        Ok(ticket)
    }

    /// Resolve an open todo and resume its ticket.
    ///
    /// The todo is closed with a compare-and-set, so only one resolution ever
    /// advances the ticket; later attempts get `AlreadyResolved`.
    pub async fn resolve_todo(
        &self,
        todo_id: &str,
        username: &str,
        action: TodoAction,
        params: Option<Value>,
    ) -> Result<Todo, ManagerError> {
        let todo = self
            .todos
            .get(todo_id)?
            .ok_or_else(|| TodoError::NotFound(todo_id.to_string()))?;

        if !todo.status.is_open() {
            return Err(TodoError::AlreadyResolved {
                todo_id: todo.id,
                status: todo.status,
            }
            .into());
        }
        if !todo.todo_type.accepts(action) {
            return Err(TodoError::InvalidAction {
                action,
                todo_type: todo.todo_type,
            }
            .into());
        }
        if !todo.is_operator(username) {
            warn!(
                "User {} tried to resolve todo {} without being an operator",
                username, todo.id
            );
            return Err(TodoError::WrongOperator {
                todo_id: todo.id,
                username: username.to_string(),
            }
            .into());
        }

        let resolved = self
            .todos
            .resolve(todo_id, username, action, params)?
            .ok_or_else(|| TodoError::AlreadyResolved {
                todo_id: todo_id.to_string(),
                status: TodoStatus::Done,
            })?;

        info!(
            "Todo {} of ticket {} resolved by {}: {}",
            resolved.id, resolved.ticket_id, username, action
        );
        metrics::TODOS_RESOLVED
            .with_label_values(&[action.as_str()])
            .inc();
        audit::emit(
            &self.audit,
            AuditEvent::TodoResolved {
                ticket_id: resolved.ticket_id.clone(),
                flow_id: resolved.flow_id.clone(),
                todo_id: resolved.id.clone(),
                resolved_by: username.to_string(),
                action: action.to_string(),
            },
        )
        .await;

        match action {
            TodoAction::Terminate => {
                self.terminate_ticket(&resolved.ticket_id, username).await?;
            }
            TodoAction::Approve => {
                self.resume_flow(
                    &resolved,
                    TicketStatus::Succeeded,
                    FlowPatch::new().with_message(Some(format!("approved by {}", username))),
                )
                .await?;
            }
            TodoAction::ResourceReapply => {
                self.resume_flow(
                    &resolved,
                    TicketStatus::Pending,
                    FlowPatch::new()
                        .with_obj_id(None)
                        .with_retry_count(0)
                        .with_message(Some(format!("resources reapplied by {}", username))),
                )
                .await?;
            }
        }

        Ok(resolved)
    }

    /// Move the todo's RUNNING flow to `to` and advance the ticket.
    async fn resume_flow(
        &self,
        todo: &Todo,
        to: TicketStatus,
        patch: FlowPatch,
    ) -> Result<(), ManagerError> {
        let before = self.flow(&todo.flow_id)?;
        let updated =
            self.tickets
                .transition_flow(&todo.flow_id, &[TicketStatus::Running], to, patch)?;
        match updated {
            Some(after) => {
                self.flow_changed(&before, &after).await;
                self.run_next_flow(&todo.ticket_id).await?;
            }
            None => warn!(
                "Flow {} was {} when todo {} resolved; not advancing",
                before.id, before.status, todo.id
            ),
        }
        Ok(())
    }

    /// Terminate a ticket.
    ///
    /// The ticket and its active flow become TERMINATED, open todos are closed
    /// and a running pipeline stops scheduling nodes. Nodes already running
    /// finish and their outcome is discarded.
    pub async fn terminate_ticket(
        &self,
        ticket_id: &str,
        terminated_by: &str,
    ) -> Result<Ticket, ManagerError> {
        let ticket = self.ticket(ticket_id)?;
        if !ticket.status.can_terminate() {
            return Err(ManagerError::invalid_state(&ticket, "terminate"));
        }

        let terminable: Vec<TicketStatus> = TicketStatus::ALL
            .into_iter()
            .filter(TicketStatus::can_terminate)
            .collect();
        let updated = self
            .tickets
            .transition(ticket_id, &terminable, TicketStatus::Terminated)?
            .ok_or_else(|| {
                // Lost a race; report what it is now.
                match self.ticket(ticket_id) {
                    Ok(current) => ManagerError::invalid_state(&current, "terminate"),
                    Err(e) => e,
                }
            })?;

        let flows = self.tickets.list_flows(ticket_id)?;
        if let Some(active) = flows.into_iter().find(Flow::is_unfinished) {
            let after = self.tickets.transition_flow(
                &active.id,
                &terminable,
                TicketStatus::Terminated,
                FlowPatch::new().with_message(Some(format!("terminated by {}", terminated_by))),
            )?;
            if let Some(after) = after {
                self.flow_changed(&active, &after).await;
            }
            if active.flow_type == FlowType::Inner {
                if let Some(pipeline_id) = &active.flow_obj_id {
                    self.engine.cancel(pipeline_id)?;
                }
            }
        }

        let closed = self.todos.terminate_open(ticket_id)?;
        info!(
            "Ticket {} terminated by {} (was {}, {} todos closed)",
            ticket_id, terminated_by, ticket.status, closed
        );
        metrics::TICKETS_FINISHED
            .with_label_values(&[TicketStatus::Terminated.as_str()])
            .inc();
        audit::emit(
            &self.audit,
            AuditEvent::TicketTerminated {
                ticket_id: ticket_id.to_string(),
                terminated_by: terminated_by.to_string(),
                previous_status: ticket.status.to_string(),
            },
        )
        .await;

        Ok(updated)
    }

    /// Retry the failed or revoked flow of a ticket.
    ///
    /// An inner flow retries its failed nodes in place; succeeded nodes are not
    /// re-run. Any other flow goes back to PENDING and runs again.
    pub async fn retry_flow(&self, ticket_id: &str, retried_by: &str) -> Result<Ticket, ManagerError> {
        let ticket = self.ticket(ticket_id)?;
        if !ticket.status.can_retry() {
            return Err(ManagerError::invalid_state(&ticket, "retry"));
        }
        let flow = self
            .tickets
            .list_flows(ticket_id)?
            .into_iter()
            .find(|f| f.status.can_retry())
            .ok_or_else(|| ManagerError::invalid_state(&ticket, "retry"))?;

        let retriable = [TicketStatus::Failed, TicketStatus::Revoked];
        let failing_pipeline = match (&flow.flow_type, &flow.flow_obj_id) {
            (FlowType::Inner, Some(pipeline_id)) => self
                .engine
                .failing_node(pipeline_id)
                .ok()
                .flatten()
                .map(|_| pipeline_id.clone()),
            _ => None,
        };

        if let Some(pipeline_id) = failing_pipeline {
            // Reopen first so the pipeline's next terminal event settles the flow.
            // The lock keeps a refresh from seeing RUNNING over a still-failed root.
            let _guard = self.flow_locks.acquire(&flow.id).await;
            let after = self
                .reopen(&ticket, &flow, format!("retried by {}", retried_by))
                .await?
                .ok_or_else(|| ManagerError::invalid_state(&ticket, "retry"))?;
            if let Err(e) = self.engine.retry_failed(&pipeline_id, retried_by).await {
                self.restore(&ticket, &flow)?;
                return Err(e.into());
            }
            self.flow_changed(&flow, &after).await;
        } else {
            let after = self
                .tickets
                .transition_flow(
                    &flow.id,
                    &retriable,
                    TicketStatus::Pending,
                    FlowPatch::new()
                        .with_obj_id(None)
                        .with_retry_count(0)
                        .with_message(Some(format!("retried by {}", retried_by))),
                )?
                .ok_or_else(|| ManagerError::invalid_state(&ticket, "retry"))?;
            self.flow_changed(&flow, &after).await;
            self.reopen_ticket(&ticket).await?;
            self.run_next_flow(ticket_id).await?;
        }

        info!("Flow {} of ticket {} retried by {}", flow.id, ticket_id, retried_by);
        audit::emit(
            &self.audit,
            AuditEvent::FlowRetried {
                ticket_id: ticket_id.to_string(),
                flow_id: flow.id.clone(),
                retried_by: retried_by.to_string(),
            },
        )
        .await;

        self.ticket(ticket_id)
    }

    /// Retry one failed node (or every failed leaf under a composite).
    pub async fn retry_node(&self, node_id: &str, retried_by: &str) -> Result<usize, ManagerError> {
        let (ticket, flow) = self.node_owner(node_id, "retry node of")?;

        // Reopen first so the pipeline's next terminal event settles the flow.
        let _guard = self.flow_locks.acquire(&flow.id).await;
        let reopened = if flow.status.can_retry() {
            self.reopen(&ticket, &flow, format!("node retried by {}", retried_by))
                .await?
        } else {
            None
        };

        let reset = match self.engine.retry_node(node_id, retried_by).await {
            Ok(reset) => reset,
            Err(e) => {
                if reopened.is_some() {
                    self.restore(&ticket, &flow)?;
                }
                return Err(e.into());
            }
        };

        if let Some(after) = reopened {
            self.flow_changed(&flow, &after).await;
        }
        Ok(reset)
    }

    /// Hold a node (or every READY leaf under it) until resumed.
    pub fn pause_node(&self, node_id: &str) -> Result<usize, ManagerError> {
        self.node_owner(node_id, "pause node of")?;
        Ok(self.engine.pause_node(node_id)?)
    }

    /// Release paused nodes and let the pipeline continue.
    pub fn resume_node(&self, node_id: &str) -> Result<usize, ManagerError> {
        self.node_owner(node_id, "resume node of")?;
        Ok(self.engine.resume_node(node_id)?)
    }

    /// Ticket, its flows, open todos and, for a failed pipeline, the failing node.
    pub fn get_ticket_status(&self, ticket_id: &str) -> Result<TicketStatusView, ManagerError> {
        let ticket = self.ticket(ticket_id)?;
        let flows = self.tickets.list_flows(ticket_id)?;
        let active_flow = flows
            .iter()
            .find(|f| f.is_unfinished())
            .or_else(|| flows.last())
            .cloned();

        let open_todos = self.todos.list(
            &TodoFilter::new()
                .with_ticket_id(ticket_id)
                .with_status(TodoStatus::Todo),
        )?;

        let failing_node = match &active_flow {
            Some(flow) if flow.flow_type == FlowType::Inner && flow.status.is_negative() => {
                match &flow.flow_obj_id {
                    Some(pipeline_id) => self.engine.failing_node(pipeline_id)?.map(Into::into),
                    None => None,
                }
            }
            _ => None,
        };

        Ok(TicketStatusView {
            overall_status: ticket.status,
            active_flow_detail: active_flow.as_ref().and_then(|f| f.message.clone()),
            ticket,
            flows,
            active_flow,
            open_todos,
            failing_node,
        })
    }

    pub fn get_ticket(&self, ticket_id: &str) -> Result<Ticket, ManagerError> {
        self.ticket(ticket_id)
    }

    pub fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, ManagerError> {
        Ok(self.tickets.list(filter)?)
    }

    pub fn count_tickets(&self, filter: &TicketFilter) -> Result<i64, ManagerError> {
        Ok(self.tickets.count(filter)?)
    }

    pub fn list_todos(&self, filter: &TodoFilter) -> Result<Vec<Todo>, ManagerError> {
        Ok(self.todos.list(filter)?)
    }

    /// Failed/revoked ticket back to RUNNING after a retry.
    async fn reopen_ticket(&self, ticket: &Ticket) -> Result<(), ManagerError> {
        let updated = self.tickets.transition(
            &ticket.id,
            &[TicketStatus::Failed, TicketStatus::Revoked],
            TicketStatus::Running,
        )?;
        if let Some(updated) = updated {
            self.ticket_changed(ticket.status, &updated, Some("retried".to_string()))
                .await;
        }
        Ok(())
    }

    /// Failed/revoked inner flow and its ticket back to RUNNING.
    async fn reopen(
        &self,
        ticket: &Ticket,
        flow: &Flow,
        message: String,
    ) -> Result<Option<Flow>, ManagerError> {
        let after = self.tickets.transition_flow(
            &flow.id,
            &[TicketStatus::Failed, TicketStatus::Revoked],
            TicketStatus::Running,
            FlowPatch::new().with_message(Some(message)),
        )?;
        if after.is_some() {
            self.reopen_ticket(ticket).await?;
        }
        Ok(after)
    }

    /// Undo `reopen` when the engine refused the retry.
    fn restore(&self, ticket: &Ticket, flow: &Flow) -> Result<(), ManagerError> {
        self.tickets.transition_flow(
            &flow.id,
            &[TicketStatus::Running],
            flow.status,
            FlowPatch::new().with_message(flow.message.clone()),
        )?;
        self.tickets
            .transition(&ticket.id, &[TicketStatus::Running], ticket.status)?;
        Ok(())
    }

    /// Ticket and flow that own a node; terminated tickets reject node operations.
    fn node_owner(&self, node_id: &str, operation: &str) -> Result<(Ticket, Flow), ManagerError> {
        let node = self.engine.node(node_id)?;
        let run = self.engine.run(&node.pipeline_id)?;
        let ticket = self.ticket(&run.ticket_id)?;
        if matches!(ticket.status, TicketStatus::Terminated | TicketStatus::Succeeded) {
            return Err(ManagerError::invalid_state(&ticket, operation));
        }
        let flow = self.flow(&run.flow_id)?;
        Ok((ticket, flow))
    }
}
