//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the dbflow server:
//! - HTTP request metrics (latency, counts)
//! - Ticket counts by status and open todos (collected dynamically)
//! - Everything the core registers (flows, nodes, mutex, external calls)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use dbflow_core::{ticket::TicketFilter, TicketStatus};

use crate::state::AppState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "dbflow_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dbflow_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "dbflow_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Manager Metrics
// =============================================================================

/// Tickets by current status (collected dynamically).
pub static TICKETS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("dbflow_tickets_by_status", "Current ticket count by status"),
        &["status"],
    )
    .unwrap()
});

/// Todos waiting on an operator.
pub static TODOS_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("dbflow_todos_open", "Todos waiting for an operator").unwrap()
});

/// Clusters held by a running mutating node.
pub static CLUSTERS_LOCKED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "dbflow_clusters_locked",
        "Clusters currently held by the execution mutex",
    )
    .unwrap()
});

/// Whether the pipeline engine loop is running (1) or not (0).
pub static ENGINE_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "dbflow_engine_running",
        "Whether the pipeline engine loop is running",
    )
    .unwrap()
});

/// Whether the ticket flow manager is running (1) or not (0).
pub static MANAGER_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "dbflow_manager_running",
        "Whether the ticket flow manager is running",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Manager
    registry
        .register(Box::new(TICKETS_BY_STATUS.clone()))
        .unwrap();
    registry.register(Box::new(TODOS_OPEN.clone())).unwrap();
    registry
        .register(Box::new(MANAGER_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(ENGINE_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(CLUSTERS_LOCKED.clone()))
        .unwrap();

    // Core metrics (manager, engine, external services)
    for metric in dbflow_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Refresh the gauges from the manager before encoding.
pub fn collect_dynamic_metrics(state: &AppState) {
    let manager = state.manager();
    let status = manager.status();
    MANAGER_RUNNING.set(i64::from(status.running));
    ENGINE_RUNNING.set(i64::from(status.engine_running));
    TODOS_OPEN.set(status.open_todos as i64);
    CLUSTERS_LOCKED.set(manager.engine().locked_clusters() as i64);

    for ticket_status in TicketStatus::ALL {
        let filter = TicketFilter::new().with_status(ticket_status);
        if let Ok(count) = manager.count_tickets(&filter) {
            TICKETS_BY_STATUS
                .with_label_values(&[ticket_status.as_str()])
                .set(count);
        }
    }
}

static UUID_SEGMENT: Lazy<regex_lite::Regex> = Lazy::new(|| {
    regex_lite::Regex::new(
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
    )
    .unwrap()
});

static NUMERIC_SEGMENT: Lazy<regex_lite::Regex> =
    Lazy::new(|| regex_lite::Regex::new(r"/\d+(/|$)").unwrap());

/// Normalize a path for metric labels (ticket, node and todo ids become `{id}`).
pub fn normalize_path(path: &str) -> String {
    let result = UUID_SEGMENT.replace_all(path, "{id}");
    NUMERIC_SEGMENT
        .replace_all(&result, "/{id}$1")
        .into_owned()
}
