use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },

    // Ticket lifecycle
    TicketCreated {
        ticket_id: String,
        ticket_type: String,
        tenant_id: String,
        created_by: String,
        flow_count: usize,
    },
    TicketStatusChanged {
        ticket_id: String,
        from_status: String,
        to_status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TicketTerminated {
        ticket_id: String,
        terminated_by: String,
        previous_status: String,
    },

    // Flow lifecycle
    FlowStatusChanged {
        ticket_id: String,
        flow_id: String,
        flow_type: String,
        from_status: String,
        to_status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    FlowRetried {
        ticket_id: String,
        flow_id: String,
        retried_by: String,
    },

    // Pipeline nodes
    NodeStatusChanged {
        ticket_id: String,
        node_id: String,
        node_name: String,
        from_status: String,
        to_status: String,
        version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    NodeRetried {
        ticket_id: String,
        node_id: String,
        /// Version after the retry
        version: u32,
        retried_by: String,
    },
    MutexConflict {
        ticket_id: String,
        node_id: String,
        cluster_id: String,
        /// Ticket currently holding the cluster
        held_by: String,
        policy: String,
        attempt: u32,
    },

    // Human decisions
    TodoCreated {
        ticket_id: String,
        flow_id: String,
        todo_id: String,
        todo_type: String,
        operators: Vec<String>,
    },
    TodoResolved {
        ticket_id: String,
        flow_id: String,
        todo_id: String,
        resolved_by: String,
        action: String,
    },
}

impl AuditEvent {
    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::TicketCreated { .. } => "ticket_created",
            Self::TicketStatusChanged { .. } => "ticket_status_changed",
            Self::TicketTerminated { .. } => "ticket_terminated",
            Self::FlowStatusChanged { .. } => "flow_status_changed",
            Self::FlowRetried { .. } => "flow_retried",
            Self::NodeStatusChanged { .. } => "node_status_changed",
            Self::NodeRetried { .. } => "node_retried",
            Self::MutexConflict { .. } => "mutex_conflict",
            Self::TodoCreated { .. } => "todo_created",
            Self::TodoResolved { .. } => "todo_resolved",
        }
    }

    /// Extract ticket_id if this event is ticket-related
    pub fn ticket_id(&self) -> Option<&str> {
        match self {
            Self::TicketCreated { ticket_id, .. }
            | Self::TicketStatusChanged { ticket_id, .. }
            | Self::TicketTerminated { ticket_id, .. }
            | Self::FlowStatusChanged { ticket_id, .. }
            | Self::FlowRetried { ticket_id, .. }
            | Self::NodeStatusChanged { ticket_id, .. }
            | Self::NodeRetried { ticket_id, .. }
            | Self::MutexConflict { ticket_id, .. }
            | Self::TodoCreated { ticket_id, .. }
            | Self::TodoResolved { ticket_id, .. } => Some(ticket_id),
            Self::ServiceStarted { .. } | Self::ServiceStopped { .. } => None,
        }
    }

    /// Extract user_id if this event was triggered by a user action
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::TicketCreated { created_by, .. } => Some(created_by),
            Self::TicketTerminated { terminated_by, .. } => Some(terminated_by),
            Self::FlowRetried { retried_by, .. } | Self::NodeRetried { retried_by, .. } => {
                Some(retried_by)
            }
            Self::TodoResolved { resolved_by, .. } => Some(resolved_by),
            _ => None,
        }
    }

    /// Flow the event belongs to, for flow and todo events
    pub fn flow_id(&self) -> Option<&str> {
        match self {
            Self::FlowStatusChanged { flow_id, .. }
            | Self::FlowRetried { flow_id, .. }
            | Self::TodoCreated { flow_id, .. }
            | Self::TodoResolved { flow_id, .. } => Some(flow_id),
            _ => None,
        }
    }

    pub fn cluster_id(&self) -> Option<&str> {
        match self {
            Self::MutexConflict { cluster_id, .. } => Some(cluster_id),
            _ => None,
        }
    }
}

/// A stored audit record.
///
/// The indexed columns are copied out of the event so the trail can be
/// filtered without decoding `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Zero until the record has been stored
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    pub user_id: Option<String>,
    pub data: AuditEvent,
}

impl AuditRecord {
    pub fn from_event(timestamp: DateTime<Utc>, event: AuditEvent) -> Self {
        Self {
            id: 0,
            timestamp,
            event_type: event.event_type().to_string(),
            ticket_id: event.ticket_id().map(String::from),
            flow_id: event.flow_id().map(String::from),
            cluster_id: event.cluster_id().map(String::from),
            user_id: event.user_id().map(String::from),
            data: event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_service_started() {
        let event = AuditEvent::ServiceStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc123".to_string(),
        };
        assert_eq!(event.event_type(), "service_started");
        assert_eq!(event.ticket_id(), None);
        assert_eq!(event.user_id(), None);
    }

    #[test]
    fn test_event_type_ticket_created() {
        let event = AuditEvent::TicketCreated {
            ticket_id: "ticket-123".to_string(),
            ticket_type: "cluster_apply".to_string(),
            tenant_id: "biz-1".to_string(),
            created_by: "alice".to_string(),
            flow_count: 5,
        };
        assert_eq!(event.event_type(), "ticket_created");
        assert_eq!(event.ticket_id(), Some("ticket-123"));
        assert_eq!(event.user_id(), Some("alice"));
    }

    #[test]
    fn test_event_type_mutex_conflict() {
        let event = AuditEvent::MutexConflict {
            ticket_id: "t-3".to_string(),
            node_id: "n-1".to_string(),
            cluster_id: "cluster-c".to_string(),
            held_by: "t-2".to_string(),
            policy: "manual".to_string(),
            attempt: 1,
        };
        assert_eq!(event.event_type(), "mutex_conflict");
        assert_eq!(event.ticket_id(), Some("t-3"));
        assert_eq!(event.cluster_id(), Some("cluster-c"));
        assert_eq!(event.flow_id(), None);
        assert_eq!(event.user_id(), None);
    }

    #[test]
    fn test_todo_resolved_user() {
        let event = AuditEvent::TodoResolved {
            ticket_id: "t-1".to_string(),
            flow_id: "f-2".to_string(),
            todo_id: "d-1".to_string(),
            resolved_by: "alice".to_string(),
            action: "approve".to_string(),
        };
        assert_eq!(event.event_type(), "todo_resolved");
        assert_eq!(event.flow_id(), Some("f-2"));
        assert_eq!(event.user_id(), Some("alice"));
    }

    #[test]
    fn test_serialize_deserialize_flow_status_changed() {
        let event = AuditEvent::FlowStatusChanged {
            ticket_id: "t-001".to_string(),
            flow_id: "f-001".to_string(),
            flow_type: "approval".to_string(),
            from_status: "running".to_string(),
            to_status: "succeeded".to_string(),
            message: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"flow_status_changed\""));
        // None message should be skipped
        assert!(!json.contains("message"));

        let deserialized: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "flow_status_changed");
        assert_eq!(deserialized.ticket_id(), Some("t-001"));
    }

    #[test]
    fn test_record_from_event_copies_columns() {
        let record = AuditRecord::from_event(
            Utc::now(),
            AuditEvent::TodoCreated {
                ticket_id: "t-1".to_string(),
                flow_id: "f-2".to_string(),
                todo_id: "d-1".to_string(),
                todo_type: "resource_replenish".to_string(),
                operators: vec!["alice".to_string()],
            },
        );
        assert_eq!(record.id, 0);
        assert_eq!(record.event_type, "todo_created");
        assert_eq!(record.ticket_id.as_deref(), Some("t-1"));
        assert_eq!(record.flow_id.as_deref(), Some("f-2"));
        assert_eq!(record.cluster_id, None);
        assert_eq!(record.user_id, None);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["data"]["type"], "todo_created");
        assert!(json.get("cluster_id").is_none());
    }
}
