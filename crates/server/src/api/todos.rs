//! Todo API handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use dbflow_core::todo::{Todo, TodoAction, TodoFilter, TodoStatus};

use super::error::ApiError;
use super::middleware::AuthUser;
use crate::state::AppState;

/// Maximum allowed limit for todo queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for todo queries
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters for listing todos
#[derive(Debug, Deserialize)]
pub struct ListTodosParams {
    pub ticket_id: Option<String>,
    /// Filter by status ("todo", "done", "terminated")
    pub status: Option<String>,
    /// Only todos this user may resolve
    pub operator: Option<String>,
    pub limit: Option<i64>,
}

/// Request body for resolving a todo
#[derive(Debug, Deserialize)]
pub struct ResolveTodoBody {
    pub action: TodoAction,
    /// Extra parameters recorded with the resolution
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ListTodosResponse {
    pub todos: Vec<Todo>,
}

/// List todos with optional filters
pub async fn list_todos(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListTodosParams>,
) -> Result<Json<ListTodosResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let mut filter = TodoFilter::new().with_limit(limit);

    if let Some(ticket_id) = params.ticket_id {
        filter = filter.with_ticket_id(ticket_id);
    }

    if let Some(ref status) = params.status {
        let status: TodoStatus = status.parse().map_err(ApiError::bad_request)?;
        filter = filter.with_status(status);
    }

    if let Some(operator) = params.operator {
        filter = filter.with_operator(operator);
    }

    let todos = state.manager().list_todos(&filter)?;
    Ok(Json(ListTodosResponse { todos }))
}

/// Resolve a todo as the calling user
pub async fn resolve_todo(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<ResolveTodoBody>,
) -> Result<Json<Todo>, ApiError> {
    let todo = state
        .manager()
        .resolve_todo(&id, &user, body.action, body.params)
        .await?;
    Ok(Json(todo))
}
