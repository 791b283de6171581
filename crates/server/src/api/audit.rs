//! Audit trail endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use dbflow_core::audit::{AuditError, AuditFilter, AuditRecord};

use super::error::ApiError;
use crate::state::AppState;

/// Maximum allowed limit for audit queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for audit queries
const DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub ticket_id: Option<String>,
    pub flow_id: Option<String>,
    /// Mutex conflicts on one cluster
    pub cluster_id: Option<String>,
    /// One event type, or several separated by commas
    pub event_type: Option<String>,
    /// Acting user
    pub user_id: Option<String>,
    /// Events at or after this instant (RFC 3339)
    pub since: Option<DateTime<Utc>>,
    /// Events before this instant (RFC 3339)
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub newest_first: bool,
    /// Maximum number of events to return (default 100, max 1000)
    pub limit: Option<i64>,
    /// Pagination offset (default 0)
    pub offset: Option<i64>,
}

impl AuditQueryParams {
    fn filter(&self) -> AuditFilter {
        let mut filter = AuditFilter::new();
        if let Some(ref ticket_id) = self.ticket_id {
            filter = filter.with_ticket_id(ticket_id);
        }
        if let Some(ref flow_id) = self.flow_id {
            filter = filter.with_flow_id(flow_id);
        }
        if let Some(ref cluster_id) = self.cluster_id {
            filter = filter.with_cluster_id(cluster_id);
        }
        if let Some(ref user_id) = self.user_id {
            filter = filter.with_user_id(user_id);
        }
        for event_type in self
            .event_type
            .iter()
            .flat_map(|types| types.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            filter = filter.with_event_type(event_type);
        }
        if let Some(since) = self.since {
            filter = filter.with_since(since);
        }
        if let Some(until) = self.until {
            filter = filter.with_until(until);
        }
        if self.newest_first {
            filter = filter.newest_first();
        }
        filter
    }
}

#[derive(Debug, Serialize)]
pub struct AuditQueryResponse {
    pub events: Vec<AuditRecord>,
    /// Total number of matching events
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct TicketHistoryResponse {
    pub ticket_id: String,
    pub events: Vec<AuditRecord>,
}

fn store_error(e: AuditError) -> ApiError {
    ApiError::internal(format!("Failed to read audit trail: {}", e))
}

/// Query audit events
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<AuditQueryResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);
    if let (Some(since), Some(until)) = (params.since, params.until) {
        if since >= until {
            return Err(ApiError::bad_request("since must be before until"));
        }
    }

    let filter = params.filter().with_limit(limit).with_offset(offset);
    let events = state.audit_store().query(&filter).map_err(store_error)?;
    let total = state.audit_store().count(&filter).map_err(store_error)?;

    Ok(Json(AuditQueryResponse {
        events,
        total,
        limit,
        offset,
    }))
}

/// Everything recorded for one ticket, oldest first
pub async fn ticket_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TicketHistoryResponse>, ApiError> {
    // 404 for unknown tickets rather than an empty history
    let ticket = state.manager().get_ticket(&id)?;
    let events = state
        .audit_store()
        .query(&AuditFilter::ticket_history(&ticket.id))
        .map_err(store_error)?;

    Ok(Json(TicketHistoryResponse {
        ticket_id: ticket.id,
        events,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(query: &str) -> AuditQueryParams {
        serde_json::from_value(serde_json::Value::Object(
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect(),
        ))
        .unwrap()
    }

    #[test]
    fn test_event_type_list_is_split() {
        let filter = params("event_type=mutex_conflict, node_retried,").filter();
        assert_eq!(filter.event_types, vec!["mutex_conflict", "node_retried"]);
    }

    #[test]
    fn test_filter_fields() {
        let filter = params("ticket_id=t-1&cluster_id=c-9&user_id=alice").filter();
        assert_eq!(filter.ticket_id.as_deref(), Some("t-1"));
        assert_eq!(filter.cluster_id.as_deref(), Some("c-9"));
        assert_eq!(filter.user_id.as_deref(), Some("alice"));
        assert!(filter.event_types.is_empty());
        assert!(!filter.newest_first);
    }
}
