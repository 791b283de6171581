//! Ticket API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use dbflow_core::{
    ticket::TicketFilter, RetryPolicy, SubmitTicketRequest, Ticket, TicketStatus,
    TicketStatusView,
};

use super::error::ApiError;
use super::middleware::AuthUser;
use crate::state::AppState;

/// Maximum allowed limit for ticket queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for ticket queries
const DEFAULT_LIMIT: i64 = 100;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for submitting a ticket
#[derive(Debug, Deserialize)]
pub struct CreateTicketBody {
    pub ticket_type: String,
    pub tenant_id: String,
    /// Ticket-type specific parameters
    #[serde(default)]
    pub details: serde_json::Value,
    /// Reaction to cluster mutex conflicts (default: the ticket type's)
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

/// Query parameters for listing tickets
#[derive(Debug, Deserialize)]
pub struct ListTicketsParams {
    /// Filter by status
    pub status: Option<String>,
    /// Filter by ticket type
    pub ticket_type: Option<String>,
    /// Filter by tenant
    pub tenant_id: Option<String>,
    /// Maximum number of tickets to return
    pub limit: Option<i64>,
    /// Pagination offset
    pub offset: Option<i64>,
}

/// Response for listing tickets
#[derive(Debug, Serialize)]
pub struct ListTicketsResponse {
    pub tickets: Vec<Ticket>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Response for node actions
#[derive(Debug, Serialize)]
pub struct NodeActionResponse {
    pub node_id: String,
    /// Nodes affected by the action
    pub affected: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a new ticket
pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateTicketBody>,
) -> Result<(StatusCode, Json<Ticket>), ApiError> {
    let request = SubmitTicketRequest {
        ticket_type: body.ticket_type,
        tenant_id: body.tenant_id,
        created_by: user,
        details: body.details,
        retry_policy: body.retry_policy,
    };

    let ticket = state.manager().submit_ticket(request).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

/// Ticket with its flows, open todos and failing node
pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TicketStatusView>, ApiError> {
    Ok(Json(state.manager().get_ticket_status(&id)?))
}

/// List tickets with optional filters
pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListTicketsParams>,
) -> Result<Json<ListTicketsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = TicketFilter::new().with_limit(limit).with_offset(offset);

    if let Some(ref status) = params.status {
        let status: TicketStatus = status.parse().map_err(ApiError::bad_request)?;
        filter = filter.with_status(status);
    }

    if let Some(ref ticket_type) = params.ticket_type {
        filter = filter.with_ticket_type(ticket_type);
    }

    if let Some(ref tenant_id) = params.tenant_id {
        filter = filter.with_tenant_id(tenant_id);
    }

    let tickets = state.manager().list_tickets(&filter)?;

    // Get total count (without pagination)
    let count_filter = TicketFilter {
        limit: i64::MAX,
        offset: 0,
        ..filter.clone()
    };
    let total = state.manager().count_tickets(&count_filter)?;

    Ok(Json(ListTicketsResponse {
        tickets,
        total,
        limit,
        offset,
    }))
}

/// Terminate a ticket and close its open todos
pub async fn terminate_ticket(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Ticket>, ApiError> {
    Ok(Json(state.manager().terminate_ticket(&id, &user).await?))
}

/// Retry the failed or revoked flow of a ticket
pub async fn retry_ticket(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Ticket>, ApiError> {
    Ok(Json(state.manager().retry_flow(&id, &user).await?))
}

/// Retry one failed pipeline node (or the failed leaves under it)
pub async fn retry_node(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<NodeActionResponse>, ApiError> {
    let affected = state.manager().retry_node(&id, &user).await?;
    Ok(Json(NodeActionResponse {
        node_id: id,
        affected,
    }))
}

/// Hold a node back from scheduling
pub async fn pause_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NodeActionResponse>, ApiError> {
    let affected = state.manager().pause_node(&id)?;
    Ok(Json(NodeActionResponse {
        node_id: id,
        affected,
    }))
}

/// Release a paused node
pub async fn resume_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NodeActionResponse>, ApiError> {
    let affected = state.manager().resume_node(&id)?;
    Ok(Json(NodeActionResponse {
        node_id: id,
        affected,
    }))
}
