//! Tickets and their ordered flows.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteTicketStore;
pub use store::{CreateTicketRequest, FlowPatch, NewFlow, TicketError, TicketFilter, TicketStore};
pub use types::{Flow, FlowType, RetryPolicy, Ticket, TicketStatus};
