//! Ticket storage trait and types.

use std::fmt;

use crate::ticket::{Flow, FlowType, RetryPolicy, Ticket, TicketStatus};

/// Error type for ticket operations.
#[derive(Debug)]
pub enum TicketError {
    /// Ticket or flow not found.
    NotFound(String),
    /// Cannot perform operation due to current state.
    InvalidState {
        ticket_id: String,
        current_state: String,
        operation: String,
    },
    /// Database error.
    Database(String),
}

impl fmt::Display for TicketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketError::NotFound(id) => write!(f, "Ticket not found: {}", id),
            TicketError::InvalidState {
                ticket_id,
                current_state,
                operation,
            } => write!(
                f,
                "Cannot {} ticket {}: current state is {}",
                operation, ticket_id, current_state
            ),
            TicketError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for TicketError {}

/// A flow to create together with its ticket.
#[derive(Debug, Clone)]
pub struct NewFlow {
    pub flow_type: FlowType,
    pub alias: String,
    pub details: serde_json::Value,
}

/// Request to create a new ticket.
#[derive(Debug, Clone)]
pub struct CreateTicketRequest {
    /// Ticket type tag.
    pub ticket_type: String,
    /// Tenant / business id.
    pub tenant_id: String,
    /// User creating the ticket.
    pub created_by: String,
    /// Mutex conflict policy.
    pub retry_policy: RetryPolicy,
    /// Validated ticket parameters.
    pub details: serde_json::Value,
    /// Flows in execution order.
    pub flows: Vec<NewFlow>,
}

/// Field changes applied together with a flow status transition.
///
/// `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct FlowPatch {
    pub flow_obj_id: Option<Option<String>>,
    pub message: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub details: Option<serde_json::Value>,
}

impl FlowPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_obj_id(mut self, obj_id: Option<String>) -> Self {
        self.flow_obj_id = Some(obj_id);
        self
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Filter for querying tickets.
#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    /// Filter by status.
    pub status: Option<TicketStatus>,
    /// Filter by ticket type.
    pub ticket_type: Option<String>,
    /// Filter by tenant.
    pub tenant_id: Option<String>,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl TicketFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            status: None,
            ticket_type: None,
            tenant_id: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: TicketStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_ticket_type(mut self, ticket_type: impl Into<String>) -> Self {
        self.ticket_type = Some(ticket_type.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for ticket and flow storage backends.
///
/// Status changes are compare-and-set: `transition*` methods only apply when the
/// stored status is one of `from`, and return `Ok(None)` when another writer got
/// there first.
pub trait TicketStore: Send + Sync {
    /// Create a ticket and its flows atomically.
    fn create(&self, request: CreateTicketRequest) -> Result<Ticket, TicketError>;

    /// Get a ticket by ID.
    fn get(&self, id: &str) -> Result<Option<Ticket>, TicketError>;

    /// List tickets matching the filter (newest first).
    fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, TicketError>;

    /// Count tickets matching the filter.
    fn count(&self, filter: &TicketFilter) -> Result<i64, TicketError>;

    /// Move a ticket to `to` if its current status is in `from`.
    fn transition(
        &self,
        id: &str,
        from: &[TicketStatus],
        to: TicketStatus,
    ) -> Result<Option<Ticket>, TicketError>;

    /// All flows of a ticket, ordered by index.
    fn list_flows(&self, ticket_id: &str) -> Result<Vec<Flow>, TicketError>;

    /// Get a flow by ID.
    fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, TicketError>;

    /// Move a flow to `to` if its current status is in `from`, applying `patch`.
    fn transition_flow(
        &self,
        flow_id: &str,
        from: &[TicketStatus],
        to: TicketStatus,
        patch: FlowPatch,
    ) -> Result<Option<Flow>, TicketError>;

    /// Flows of one type currently in `status` (used for restart recovery).
    fn find_flows(&self, flow_type: FlowType, status: TicketStatus)
        -> Result<Vec<Flow>, TicketError>;
}
