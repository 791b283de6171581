//! Ticket flow manager.
//!
//! The manager sequences each ticket's flows strictly in index order:
//! - **Start**: the first unfinished flow is claimed and handed to its runner
//! - **Wait**: approval flows are polled, pipelines report through engine
//!   events, pause and resource flows wait on todo resolution
//! - **Halt**: a failed, revoked or terminated flow stops the ticket until an
//!   operator retries or terminates it

mod actions;
mod config;
mod locks;
mod runner;
mod types;

pub use config::ManagerConfig;
pub use runner::TicketFlowManager;
pub use types::{FailingNode, ManagerError, ManagerStatus, SubmitTicketRequest, TicketStatusView};
