use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{audit, handlers, middleware::metrics_middleware, tickets, todos};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Audit
        .route("/audit", get(audit::query_audit))
        // Tickets
        .route("/tickets", post(tickets::create_ticket))
        .route("/tickets", get(tickets::list_tickets))
        .route("/tickets/{id}", get(tickets::get_ticket))
        .route("/tickets/{id}/terminate", post(tickets::terminate_ticket))
        .route("/tickets/{id}/retry", post(tickets::retry_ticket))
        .route("/tickets/{id}/history", get(audit::ticket_history))
        // Pipeline nodes
        .route("/nodes/{id}/retry", post(tickets::retry_node))
        .route("/nodes/{id}/pause", post(tickets::pause_node))
        .route("/nodes/{id}/resume", post(tickets::resume_node))
        // Todos
        .route("/todos", get(todos::list_todos))
        .route("/todos/{id}/resolve", post(todos::resolve_todo))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}
