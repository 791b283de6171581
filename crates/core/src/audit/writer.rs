use std::sync::Arc;

use tokio::sync::mpsc;

use super::{AuditHandle, AuditRecord, AuditStore};
use crate::metrics;

/// Most records written in one transaction.
const MAX_BATCH: usize = 64;

/// Background task draining the audit channel into the store.
///
/// Whatever has queued up since the last write goes into a single
/// transaction, so a burst of node transitions costs one commit.
pub struct AuditWriter {
    rx: mpsc::Receiver<AuditRecord>,
    store: Arc<dyn AuditStore>,
}

impl AuditWriter {
    pub fn new(rx: mpsc::Receiver<AuditRecord>, store: Arc<dyn AuditStore>) -> Self {
        Self { rx, store }
    }

    /// Run until every handle has been dropped and the channel is drained.
    pub async fn run(mut self) {
        tracing::info!("Audit writer started");

        let mut batch = Vec::with_capacity(MAX_BATCH);
        while self.rx.recv_many(&mut batch, MAX_BATCH).await > 0 {
            self.write(&batch);
            batch.clear();
        }

        tracing::info!("Audit writer shutting down");
    }

    fn write(&self, batch: &[AuditRecord]) {
        match self.store.insert_batch(batch) {
            Ok(stored) => {
                metrics::AUDIT_RECORDS_WRITTEN
                    .with_label_values(&["stored"])
                    .inc_by(stored as u64);
            }
            Err(e) => {
                metrics::AUDIT_RECORDS_WRITTEN
                    .with_label_values(&["failed"])
                    .inc_by(batch.len() as u64);
                tracing::error!("Failed to write {} audit records: {}", batch.len(), e);
            }
        }
    }
}

/// Create a handle/writer pair; spawn `writer.run()` as a background task.
pub fn create_audit_system(
    store: Arc<dyn AuditStore>,
    buffer_size: usize,
) -> (AuditHandle, AuditWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (AuditHandle::new(tx), AuditWriter::new(rx, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEvent, AuditFilter, SqliteAuditStore};
    use tokio_test::{assert_pending, assert_ready};

    fn flow_changed(ticket: &str, to: &str) -> AuditEvent {
        AuditEvent::FlowStatusChanged {
            ticket_id: ticket.to_string(),
            flow_id: format!("{}-f1", ticket),
            flow_type: "inner".to_string(),
            from_status: "pending".to_string(),
            to_status: to.to_string(),
            message: None,
        }
    }

    #[tokio::test]
    async fn test_writer_persists_events_in_order() {
        let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let (handle, writer) = create_audit_system(store.clone(), 10);
        let writer_handle = tokio::spawn(writer.run());

        handle
            .emit(AuditEvent::TicketCreated {
                ticket_id: "t-1".to_string(),
                ticket_type: "cluster_apply".to_string(),
                tenant_id: "biz-1".to_string(),
                created_by: "alice".to_string(),
                flow_count: 5,
            })
            .await;
        handle.emit(flow_changed("t-1", "running")).await;

        drop(handle);
        writer_handle.await.unwrap();

        let records = store.query(&AuditFilter::ticket_history("t-1")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, "ticket_created");
        assert_eq!(records[0].user_id.as_deref(), Some("alice"));
        assert_eq!(records[1].event_type, "flow_status_changed");
        assert_eq!(records[1].flow_id.as_deref(), Some("t-1-f1"));
    }

    #[tokio::test]
    async fn test_queued_burst_is_fully_written() {
        let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let (handle, writer) = create_audit_system(store.clone(), 200);

        // Queue more than one batch before the writer starts.
        for i in 0..150 {
            handle.emit(flow_changed(&format!("t-{}", i), "running")).await;
        }
        drop(handle);
        writer.run().await;

        assert_eq!(store.count(&AuditFilter::new()).unwrap(), 150);
    }

    #[tokio::test]
    async fn test_writer_waits_for_all_handles_to_drop() {
        let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let (main_handle, writer) = create_audit_system(store.clone(), 10);
        let manager_handle = main_handle.clone();
        let mut task = tokio_test::task::spawn(writer.run());

        main_handle
            .emit(AuditEvent::ServiceStopped {
                reason: "graceful_shutdown".to_string(),
            })
            .await;
        drop(main_handle);

        assert_pending!(task.poll());
        assert_eq!(store.count(&AuditFilter::new()).unwrap(), 1);

        drop(manager_handle);
        assert!(task.is_woken());
        assert_ready!(task.poll());
    }
}
