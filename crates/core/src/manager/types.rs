//! Types for the ticket flow manager.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::PipelineNode;
use crate::ticket::{Flow, RetryPolicy, Ticket, TicketStatus};
use crate::todo::Todo;

/// Errors returned by manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Bad ticket parameters; nothing was persisted.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("ticket not found: {0}")]
    TicketNotFound(String),

    #[error("cannot {operation} ticket {ticket_id}: status is {status}")]
    InvalidState {
        ticket_id: String,
        status: TicketStatus,
        operation: String,
    },

    #[error("ticket store error: {0}")]
    TicketStore(#[from] crate::ticket::TicketError),

    #[error(transparent)]
    Todo(#[from] crate::todo::TodoError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("flow error: {0}")]
    Flow(#[from] crate::flow::FlowError),
}

impl ManagerError {
    pub(crate) fn invalid_state(ticket: &Ticket, operation: &str) -> Self {
        ManagerError::InvalidState {
            ticket_id: ticket.id.clone(),
            status: ticket.status,
            operation: operation.to_string(),
        }
    }
}

/// Request to submit a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTicketRequest {
    pub ticket_type: String,
    pub tenant_id: String,
    pub created_by: String,
    #[serde(default)]
    pub details: serde_json::Value,
    /// Falls back to the ticket type's default.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

/// Failed pipeline node surfaced for diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailingNode {
    pub node_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub version: u32,
}

impl From<PipelineNode> for FailingNode {
    fn from(node: PipelineNode) -> Self {
        Self {
            node_id: node.id,
            name: node.name,
            activity: node.activity,
            error: node.error,
            version: node.version,
        }
    }
}

/// Answer of `get_ticket_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketStatusView {
    pub ticket: Ticket,
    pub overall_status: TicketStatus,
    pub flows: Vec<Flow>,
    /// First flow not yet succeeded, or the last flow once all have.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_flow: Option<Flow>,
    /// Human-readable summary of the active flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_flow_detail: Option<String>,
    #[serde(default)]
    pub open_todos: Vec<Todo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_node: Option<FailingNode>,
}

/// Current status of the manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerStatus {
    /// Whether the manager is running.
    pub running: bool,
    /// Whether the pipeline engine loop is running.
    pub engine_running: bool,
    pub pending_count: usize,
    pub running_count: usize,
    pub failed_count: usize,
    /// Open todos across all tickets.
    pub open_todos: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submit_request_defaults() {
        let request: SubmitTicketRequest = serde_json::from_value(json!({
            "ticket_type": "cluster_apply",
            "tenant_id": "tenant-a",
            "created_by": "bob"
        }))
        .unwrap();
        assert!(request.details.is_null());
        assert!(request.retry_policy.is_none());

        let request: SubmitTicketRequest = serde_json::from_value(json!({
            "ticket_type": "cluster_apply",
            "tenant_id": "tenant-a",
            "created_by": "bob",
            "retry_policy": "automatic"
        }))
        .unwrap();
        assert_eq!(request.retry_policy, Some(RetryPolicy::Automatic));
    }

    #[test]
    fn test_manager_status_default() {
        let status = ManagerStatus::default();
        assert!(!status.running);
        assert_eq!(status.open_todos, 0);
    }

    #[test]
    fn test_error_display() {
        let err = ManagerError::TicketNotFound("t-9".to_string());
        assert_eq!(err.to_string(), "ticket not found: t-9");

        let err = ManagerError::InvalidState {
            ticket_id: "t-1".to_string(),
            status: TicketStatus::Terminated,
            operation: "retry".to_string(),
        };
        assert_eq!(err.to_string(), "cannot retry ticket t-1: status is terminated");
    }
}
