//! Core ticket and flow data types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status shared by tickets and their flows.
///
/// State machine:
/// ```text
/// Pending -> Running -> Succeeded
///               |
///               +-> Failed | Revoked | Terminated
/// ```
///
/// Failed and Revoked flows can be moved back to Running/Pending by an explicit retry.
/// Terminated is final for both tickets and flows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Created, nothing has run yet.
    Pending,
    /// Some flow is in progress (or waiting on a human/external system).
    Running,
    /// Every flow finished successfully.
    Succeeded,
    /// A flow failed; progression is halted until retried.
    Failed,
    /// Stopped by an operator.
    Terminated,
    /// The external approval was revoked.
    Revoked,
}

impl TicketStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TicketStatus; 6] = [
        TicketStatus::Pending,
        TicketStatus::Running,
        TicketStatus::Succeeded,
        TicketStatus::Failed,
        TicketStatus::Terminated,
        TicketStatus::Revoked,
    ];

    /// Returns the status as a string (for filtering and storage).
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Running => "running",
            TicketStatus::Succeeded => "succeeded",
            TicketStatus::Failed => "failed",
            TicketStatus::Terminated => "terminated",
            TicketStatus::Revoked => "revoked",
        }
    }

    /// Returns true if no further automatic transition happens from this status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TicketStatus::Pending | TicketStatus::Running)
    }

    /// Returns true for the terminal states that halt progression.
    pub fn is_negative(&self) -> bool {
        matches!(
            self,
            TicketStatus::Failed | TicketStatus::Terminated | TicketStatus::Revoked
        )
    }

    /// Returns true if an operator may retry from this status.
    pub fn can_retry(&self) -> bool {
        matches!(self, TicketStatus::Failed | TicketStatus::Revoked)
    }

    /// Returns true if an operator may terminate from this status.
    pub fn can_terminate(&self) -> bool {
        !matches!(self, TicketStatus::Succeeded | TicketStatus::Terminated)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TicketStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status: {}", s))
    }
}

/// Kind of stage a flow represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// Waits on the external change-approval service.
    Approval,
    /// Waits on a human confirmation todo.
    Pause,
    /// Acquires hosts from the resource pool.
    ResourceApply,
    /// Runs the ticket's pipeline.
    Inner,
    /// Terminal marker, always succeeds.
    Delivery,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Approval => "approval",
            FlowType::Pause => "pause",
            FlowType::ResourceApply => "resource_apply",
            FlowType::Inner => "inner",
            FlowType::Delivery => "delivery",
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval" => Ok(FlowType::Approval),
            "pause" => Ok(FlowType::Pause),
            "resource_apply" => Ok(FlowType::ResourceApply),
            "inner" => Ok(FlowType::Inner),
            "delivery" => Ok(FlowType::Delivery),
            other => Err(format!("unknown flow type: {}", other)),
        }
    }
}

/// How a ticket reacts when its pipeline hits a cluster held by another ticket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Fail the node right away; an operator retries it.
    #[default]
    Manual,
    /// Reschedule the node after a backoff, up to a bounded number of attempts.
    Automatic,
}

impl RetryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPolicy::Manual => "manual",
            RetryPolicy::Automatic => "automatic",
        }
    }
}

impl FromStr for RetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(RetryPolicy::Manual),
            "automatic" => Ok(RetryPolicy::Automatic),
            other => Err(format!("unknown retry policy: {}", other)),
        }
    }
}

/// A ticket representing one requested change to database infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    /// Unique identifier (UUID).
    pub id: String,

    /// Ticket type tag, resolved against the ticket type registry.
    pub ticket_type: String,

    /// Business owner / tenant the change belongs to.
    pub tenant_id: String,

    /// User who submitted the ticket.
    pub created_by: String,

    /// Overall status, derived from the active flow.
    pub status: TicketStatus,

    /// Reaction to cluster mutex conflicts.
    pub retry_policy: RetryPolicy,

    /// Validated, ticket-type specific parameters.
    pub details: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stage of a ticket's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    /// Unique identifier (UUID).
    pub id: String,

    /// Owning ticket.
    pub ticket_id: String,

    /// Position within the ticket (0-based); flows run strictly in this order.
    pub flow_index: u32,

    pub flow_type: FlowType,

    /// Human-readable name of the stage.
    pub alias: String,

    pub status: TicketStatus,

    /// External correlation id (approval id, todo id, pipeline root id, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_obj_id: Option<String>,

    /// Flow-specific settings from the ticket type template.
    #[serde(default)]
    pub details: serde_json::Value,

    /// Latest human-readable summary or error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// External call retries spent so far.
    #[serde(default)]
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Returns true if this flow has not yet reached terminal success.
    pub fn is_unfinished(&self) -> bool {
        self.status != TicketStatus::Succeeded
    }
}
