//! Durable audit trail of ticket, flow, node and todo transitions.

mod events;
mod handle;
mod sqlite;
mod store;
mod writer;

pub use events::{AuditEvent, AuditRecord};
pub(crate) use handle::emit;
pub use handle::AuditHandle;
pub use sqlite::SqliteAuditStore;
pub use store::{AuditError, AuditFilter, AuditStore};
pub use writer::{create_audit_system, AuditWriter};
