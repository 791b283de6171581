use chrono::Utc;
use tokio::sync::mpsc;

use super::{AuditEvent, AuditRecord};
use crate::metrics;

/// Sender side of the audit trail.
///
/// Records are stamped when emitted, not when written, so the stored order
/// follows the order of the transitions even when the writer lags behind.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditHandle {
    pub fn new(tx: mpsc::Sender<AuditRecord>) -> Self {
        Self { tx }
    }

    /// Emit an event, waiting for channel capacity.
    ///
    /// A closed channel drops the event; the transition that produced it has
    /// already been persisted and is not undone.
    pub async fn emit(&self, event: AuditEvent) {
        let event_type = event.event_type();
        let record = AuditRecord::from_event(Utc::now(), event);
        if self.tx.send(record).await.is_err() {
            metrics::AUDIT_EVENTS_DROPPED.inc();
            tracing::error!("Audit writer gone, dropped {} event", event_type);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Emit through an optional handle.
pub(crate) async fn emit(audit: &Option<AuditHandle>, event: AuditEvent) {
    if let Some(handle) = audit {
        handle.emit(event).await;
    }
}
