//! The five kinds of ticket stage.
//!
//! Each flow type has a [`FlowRunner`]: `run` fires the stage's work and
//! reports the status to record, `status` re-derives the status of a running
//! stage from whatever it waits on (approval service, todo, pipeline). The
//! manager owns sequencing; runners never touch ticket or flow rows.

mod approval;
mod delivery;
mod inner;
mod pause;
mod resource;

pub use approval::ApprovalFlow;
pub use delivery::DeliveryFlow;
pub use inner::InnerFlow;
pub use pause::PauseFlow;
pub use resource::{ResourceApplyFlow, HOSTS_KEY, REQUEST_ID_KEY};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::external::ExternalError;
use crate::pipeline::PipelineError;
use crate::ticket::{Flow, FlowType, Ticket, TicketStatus};
use crate::todo::{Todo, TodoError};

/// Errors raised while running or checking a flow.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("external service error: {0}")]
    External(#[from] ExternalError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("todo error: {0}")]
    Todo(#[from] TodoError),

    #[error("unknown ticket type: {0}")]
    UnknownTicketType(String),

    #[error("flow {0} has no correlation id")]
    MissingCorrelation(String),

    #[error("no runner registered for {0} flows")]
    NoRunner(FlowType),
}

impl FlowError {
    /// External failures are retried with backoff; everything else is a
    /// configuration or construction problem and fails the flow right away.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::External(
                ExternalError::HttpError(_) | ExternalError::ApiError { .. }
            )
        )
    }
}

/// What a runner wants recorded on its flow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowState {
    pub status: TicketStatus,
    /// Correlation id; `None` keeps whatever the flow has.
    pub obj_id: Option<String>,
    pub message: Option<String>,
    /// Todo opened by this call, for audit and metrics.
    pub opened_todo: Option<Todo>,
}

impl FlowState {
    pub fn new(status: TicketStatus) -> Self {
        Self {
            status,
            obj_id: None,
            message: None,
            opened_todo: None,
        }
    }

    pub fn running(obj_id: impl Into<String>) -> Self {
        Self::new(TicketStatus::Running).with_obj_id(obj_id)
    }

    pub fn succeeded() -> Self {
        Self::new(TicketStatus::Succeeded)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(TicketStatus::Failed).with_message(message)
    }

    pub fn with_obj_id(mut self, obj_id: impl Into<String>) -> Self {
        self.obj_id = Some(obj_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_todo(mut self, todo: Todo) -> Self {
        self.opened_todo = Some(todo);
        self
    }
}

/// Behaviour of one flow type.
#[async_trait]
pub trait FlowRunner: Send + Sync {
    fn flow_type(&self) -> FlowType;

    /// Start the stage. Called once per attempt, with the flow already claimed
    /// as RUNNING.
    async fn run(&self, ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError>;

    /// Current status of a RUNNING flow.
    async fn status(&self, ticket: &Ticket, flow: &Flow) -> Result<FlowState, FlowError>;
}

/// Strategy table from flow type to runner. Immutable once built.
#[derive(Clone, Default)]
pub struct FlowRunners {
    runners: HashMap<FlowType, Arc<dyn FlowRunner>>,
}

impl FlowRunners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, runner: Arc<dyn FlowRunner>) -> Self {
        self.runners.insert(runner.flow_type(), runner);
        self
    }

    pub fn get(&self, flow_type: FlowType) -> Result<Arc<dyn FlowRunner>, FlowError> {
        self.runners
            .get(&flow_type)
            .cloned()
            .ok_or(FlowError::NoRunner(flow_type))
    }

    pub fn contains(&self, flow_type: FlowType) -> bool {
        self.runners.contains_key(&flow_type)
    }
}

/// Usernames entitled to resolve a todo raised by `flow`: the flow template's
/// `operators` list, or the ticket's creator.
pub(crate) fn flow_operators(ticket: &Ticket, flow: &Flow) -> Vec<String> {
    let configured: Vec<String> = flow
        .details
        .get("operators")
        .and_then(Value::as_array)
        .map(|ops| {
            ops.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if configured.is_empty() {
        vec![ticket.created_by.clone()]
    } else {
        configured
    }
}
