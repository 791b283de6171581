use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{FlowError, FlowRunner, FlowState};
use crate::external::{ApprovalRequest, ApprovalService, ApprovalState, ApprovalStatus};
use crate::ticket::{Flow, FlowType, Ticket, TicketStatus};

/// Waits on the external change-approval service.
pub struct ApprovalFlow {
    service: Arc<dyn ApprovalService>,
}

impl ApprovalFlow {
    pub fn new(service: Arc<dyn ApprovalService>) -> Self {
        Self { service }
    }
}

/// Project an approval answer onto a flow status.
fn project(status: &ApprovalStatus) -> FlowState {
    let last_log = status.logs.last().cloned();
    let state = match (status.status, status.result) {
        (ApprovalState::Running, _) => FlowState::new(TicketStatus::Running),
        (ApprovalState::Finished, Some(true)) => {
            FlowState::succeeded().with_message("approved")
        }
        (ApprovalState::Finished, _) => FlowState::failed("approval rejected"),
        (ApprovalState::Revoked, _) => {
            FlowState::new(TicketStatus::Revoked).with_message("approval revoked")
        }
        (ApprovalState::Terminated, _) => FlowState::failed("approval terminated"),
    };

    match (last_log, &state.message) {
        (Some(log), Some(message)) => {
            let combined = format!("{}: {}", message, log);
            state.with_message(combined)
        }
        (Some(log), None) => state.with_message(log),
        _ => state,
    }
}

#[async_trait]
impl FlowRunner for ApprovalFlow {
    fn flow_type(&self) -> FlowType {
        FlowType::Approval
    }

    async fn run(&self, ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError> {
        let request = ApprovalRequest {
            ticket_id: ticket.id.clone(),
            ticket_type: ticket.ticket_type.clone(),
            tenant_id: ticket.tenant_id.clone(),
            created_by: ticket.created_by.clone(),
            details: json!({
                "ticket": ticket.details,
                "flow": flow.details,
            }),
        };
        let approval_id = self.service.create_approval(&request).await?;
        Ok(FlowState::running(approval_id.clone())
            .with_message(format!("waiting for approval {}", approval_id)))
    }

    async fn status(&self, _ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError> {
        let approval_id = flow
            .flow_obj_id
            .as_deref()
            .ok_or_else(|| FlowError::MissingCorrelation(flow.id.clone()))?;
        let status = self.service.get_approval_status(approval_id).await?;
        Ok(project(&status))
    }
}
