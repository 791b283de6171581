//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Tickets and flows (submissions, terminal outcomes, flow transitions)
//! - Pipeline engine (node outcomes, activity durations, mutex contention)
//! - Todos
//! - External services (approval, resources, job agent)
//! - The audit trail writer

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Tickets and flows
// =============================================================================

/// Tickets accepted by the manager.
pub static TICKETS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dbflow_tickets_submitted_total", "Total tickets submitted"),
        &["ticket_type"],
    )
    .unwrap()
});

/// Tickets reaching a terminal status.
pub static TICKETS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "dbflow_tickets_finished_total",
            "Total tickets reaching a terminal status",
        ),
        &["status"], // "succeeded", "failed", "terminated", "revoked"
    )
    .unwrap()
});

/// Flow status transitions.
pub static FLOW_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dbflow_flow_transitions_total", "Total flow status transitions"),
        &["flow_type", "status"],
    )
    .unwrap()
});

// =============================================================================
// Pipeline engine
// =============================================================================

/// Leaf nodes reaching a terminal status.
pub static NODES_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "dbflow_nodes_finished_total",
            "Total pipeline leaf nodes reaching a terminal status",
        ),
        &["activity", "status"],
    )
    .unwrap()
});

/// Wall time of one execute or poll call.
pub static ACTIVITY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "dbflow_activity_duration_seconds",
            "Duration of a single activity execute or poll call",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["activity"],
    )
    .unwrap()
});

/// Nodes retried by an operator.
pub static NODE_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("dbflow_node_retries_total", "Total operator node retries").unwrap()
});

/// Cluster mutex conflicts by retry policy.
pub static MUTEX_CONFLICTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "dbflow_mutex_conflicts_total",
            "Total cluster execution mutex conflicts",
        ),
        &["policy"], // "manual", "automatic"
    )
    .unwrap()
});

/// Nodes that gave up after exhausting automatic mutex retries.
pub static MUTEX_RETRIES_EXHAUSTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "dbflow_mutex_retries_exhausted_total",
        "Total nodes failed after exhausting mutex retries",
    )
    .unwrap()
});

// =============================================================================
// Todos
// =============================================================================

pub static TODOS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dbflow_todos_created_total", "Total todos created"),
        &["todo_type"],
    )
    .unwrap()
});

pub static TODOS_RESOLVED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dbflow_todos_resolved_total", "Total todos resolved"),
        &["action"],
    )
    .unwrap()
});

// =============================================================================
// External services
// =============================================================================

/// External service request duration.
pub static EXTERNAL_SERVICE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "dbflow_external_service_duration_seconds",
            "Duration of external service requests",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["service", "operation"], // service: "approval", "resources", "agent"
    )
    .unwrap()
});

/// External service request count.
pub static EXTERNAL_SERVICE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "dbflow_external_service_requests_total",
            "Total external service requests",
        ),
        &["service", "operation", "result"], // result: "success", "error"
    )
    .unwrap()
});

// =============================================================================
// Audit trail
// =============================================================================

/// Audit records written, by outcome.
pub static AUDIT_RECORDS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dbflow_audit_records_written_total", "Audit records written"),
        &["result"], // result: "stored", "failed"
    )
    .unwrap()
});

/// Audit events lost because the writer was gone.
pub static AUDIT_EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "dbflow_audit_events_dropped_total",
        "Audit events dropped before reaching the writer",
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Record an external call's duration and outcome.
pub fn observe_external<T, E>(
    service: &str,
    operation: &str,
    started: std::time::Instant,
    result: &Result<T, E>,
) {
    EXTERNAL_SERVICE_DURATION
        .with_label_values(&[service, operation])
        .observe(started.elapsed().as_secs_f64());
    let outcome = if result.is_ok() { "success" } else { "error" };
    EXTERNAL_SERVICE_REQUESTS
        .with_label_values(&[service, operation, outcome])
        .inc();
}

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Tickets and flows
        Box::new(TICKETS_SUBMITTED.clone()),
        Box::new(TICKETS_FINISHED.clone()),
        Box::new(FLOW_TRANSITIONS.clone()),
        // Pipeline engine
        Box::new(NODES_FINISHED.clone()),
        Box::new(ACTIVITY_DURATION.clone()),
        Box::new(NODE_RETRIES.clone()),
        Box::new(MUTEX_CONFLICTS.clone()),
        Box::new(MUTEX_RETRIES_EXHAUSTED.clone()),
        // Todos
        Box::new(TODOS_CREATED.clone()),
        Box::new(TODOS_RESOLVED.clone()),
        // External services
        Box::new(EXTERNAL_SERVICE_DURATION.clone()),
        Box::new(EXTERNAL_SERVICE_REQUESTS.clone()),
        // Audit trail
        Box::new(AUDIT_RECORDS_WRITTEN.clone()),
        Box::new(AUDIT_EVENTS_DROPPED.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register() {
        let registry = prometheus::Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
    }

    #[test]
    fn test_observe_external_counts_outcome() {
        let before = EXTERNAL_SERVICE_REQUESTS
            .with_label_values(&["test", "probe", "error"])
            .get();
        let result: Result<(), &str> = Err("down");
        observe_external("test", "probe", std::time::Instant::now(), &result);
        let after = EXTERNAL_SERVICE_REQUESTS
            .with_label_values(&["test", "probe", "error"])
            .get();
        assert_eq!(after, before + 1);
    }
}
