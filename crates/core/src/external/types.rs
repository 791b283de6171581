//! Wire types shared by the external service clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload sent to the change-approval service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub ticket_id: String,
    pub ticket_type: String,
    pub tenant_id: String,
    pub created_by: String,
    /// Ticket details merged with the approval flow's template settings.
    pub details: Value,
}

/// Lifecycle of an external approval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    /// Reviewers have not decided yet.
    Running,
    /// A decision exists; see `ApprovalStatus::result`.
    Finished,
    /// Withdrawn after being granted.
    Revoked,
    /// Closed without a decision.
    Terminated,
}

/// Answer of `get_approval_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalStatus {
    pub status: ApprovalState,
    /// `Some(true)` approved, `Some(false)` rejected; set once finished.
    #[serde(default)]
    pub result: Option<bool>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl ApprovalStatus {
    pub fn running() -> Self {
        Self {
            status: ApprovalState::Running,
            result: None,
            logs: Vec::new(),
        }
    }

    pub fn finished(approved: bool) -> Self {
        Self {
            status: ApprovalState::Finished,
            result: Some(approved),
            logs: Vec::new(),
        }
    }

    pub fn with_state(status: ApprovalState) -> Self {
        Self {
            status,
            result: None,
            logs: Vec::new(),
        }
    }
}

/// Resource allocation request for one ticket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequest {
    pub ticket_id: String,
    /// Opaque host spec from the ticket (count, spec class, region...).
    pub spec: Value,
}

impl ResourceRequest {
    /// Hosts requested; defaults to one.
    pub fn count(&self) -> usize {
        self.spec
            .get("count")
            .and_then(Value::as_u64)
            .map(|c| c as usize)
            .unwrap_or(1)
    }
}

/// Result of `apply_resources`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResourceOutcome {
    Allocated {
        request_id: String,
        hosts: Vec<String>,
    },
    /// Not enough capacity; an operator must replenish the pool.
    Shortage { message: String },
}

/// Answer of `poll_job`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub done: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub output: Value,
}
