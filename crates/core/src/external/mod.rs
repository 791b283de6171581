//! Clients for the systems a ticket waits on: change approval, resource
//! allocation and the remote execution agent.
//!
//! Each service is a trait with an HTTP implementation. Approval and resources
//! also have in-process fallbacks for deployments without those services.

mod agent;
mod approval;
mod resources;
mod types;

pub use agent::{HttpJobAgent, JobAgent, RemoteJobActivity};
pub use approval::{ApprovalService, AutoApproval, HttpApprovalService};
pub use resources::{HttpResourceService, ResourceService, StaticResourcePool};
pub use types::*;

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use thiserror::Error;

/// Errors from external service calls.
#[derive(Debug, Error)]
pub enum ExternalError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Service answered with a non-success status.
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// Correlation id unknown to the service.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Service not configured.
    #[error("Client not configured: {0}")]
    NotConfigured(String),
}

pub(crate) fn build_client(timeout_secs: u32) -> Result<Client, ExternalError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(u64::from(timeout_secs)))
        .build()?)
}

pub(crate) fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) if !token.is_empty() => request.bearer_auth(token),
        _ => request,
    }
}

/// Map non-success responses to `ExternalError`.
pub(crate) async fn check_status(response: Response, what: &str) -> Result<Response, ExternalError> {
    let status = response.status();
    if status == 404 {
        return Err(ExternalError::NotFound(what.to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ExternalError::ApiError {
            status: status.as_u16(),
            message: body,
        });
    }
    Ok(response)
}

pub(crate) async fn parse_json<T: serde::de::DeserializeOwned>(
    response: Response,
    what: &str,
) -> Result<T, ExternalError> {
    response
        .json()
        .await
        .map_err(|e| ExternalError::ParseError(format!("Failed to parse {}: {}", what, e)))
}

pub(crate) fn base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trims_trailing_slash() {
        assert_eq!(base_url("http://svc.local/"), "http://svc.local");
        assert_eq!(base_url("http://svc.local"), "http://svc.local");
    }

    #[test]
    fn test_error_display() {
        let err = ExternalError::ApiError {
            status: 503,
            message: "maintenance".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 503 - maintenance");
    }
}
