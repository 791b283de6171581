//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of the external service traits
//! and a scriptable activity, so whole tickets can be driven through the
//! manager without real infrastructure.
//!
//! # Example
//!
//! ```rust,ignore
//! use dbflow_core::testing::{fixtures, MockApprovalService, TestStack};
//!
//! let stack = TestStack::builder().registry(registry).activity(step).build();
//! stack.approval.set_default_status(ApprovalStatus::finished(true)).await;
//! stack.manager.start().await;
//!
//! let ticket = stack.manager.submit_ticket(request).await?;
//! fixtures::wait_for_status(&stack.manager, &ticket.id, TicketStatus::Succeeded).await;
//! ```

mod mock_agent;
mod mock_approval;
mod mock_resources;
mod scripted_activity;
mod stack;

pub use mock_agent::MockJobAgent;
pub use mock_approval::MockApprovalService;
pub use mock_resources::MockResourceService;
pub use scripted_activity::ScriptedActivity;
pub use stack::{TestStack, TestStackBuilder};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::time::Duration;

    use serde_json::Value;

    use crate::manager::{SubmitTicketRequest, TicketFlowManager};
    use crate::ticket::{RetryPolicy, TicketStatus};
    use crate::todo::{Todo, TodoFilter, TodoStatus};

    /// How long the wait helpers poll before panicking.
    pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
    const WAIT_STEP: Duration = Duration::from_millis(10);

    /// A submission with test defaults.
    pub fn submit_request(ticket_type: &str, created_by: &str, details: Value) -> SubmitTicketRequest {
        SubmitTicketRequest {
            ticket_type: ticket_type.to_string(),
            tenant_id: "tenant-test".to_string(),
            created_by: created_by.to_string(),
            details,
            retry_policy: None,
        }
    }

    pub fn with_policy(mut request: SubmitTicketRequest, policy: RetryPolicy) -> SubmitTicketRequest {
        request.retry_policy = Some(policy);
        request
    }

    /// Poll until the ticket reaches `status`.
    pub async fn wait_for_status(manager: &TicketFlowManager, ticket_id: &str, status: TicketStatus) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let current = manager
                .get_ticket(ticket_id)
                .map(|ticket| ticket.status)
                .ok();
            if current == Some(status) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "ticket {} never reached {} (last seen {:?})",
                    ticket_id, status, current
                );
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    /// Poll until the ticket has an open todo, and return the oldest one.
    pub async fn wait_for_open_todo(manager: &TicketFlowManager, ticket_id: &str) -> Todo {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        let filter = TodoFilter::new()
            .with_ticket_id(ticket_id)
            .with_status(TodoStatus::Todo);
        loop {
            if let Some(todo) = manager.list_todos(&filter).ok().and_then(|t| t.into_iter().next()) {
                return todo;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("ticket {} never opened a todo", ticket_id);
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    /// Poll until `check` holds.
    pub async fn wait_until<F>(what: &str, mut check: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while !check() {
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
    }
}
