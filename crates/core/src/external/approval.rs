//! Change-approval service.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{
    authorize, base_url, build_client, check_status, parse_json, ApprovalRequest, ApprovalStatus,
    ExternalError,
};
use crate::config::ServiceEndpointConfig;
use crate::metrics;

/// External change-approval workflow.
#[async_trait]
pub trait ApprovalService: Send + Sync {
    /// Open an approval; returns its correlation id.
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<String, ExternalError>;

    async fn get_approval_status(
        &self,
        approval_id: &str,
    ) -> Result<ApprovalStatus, ExternalError>;
}

#[derive(Debug, Deserialize)]
struct CreateApprovalResponse {
    id: String,
}

/// Approval service reached over HTTP.
///
/// `POST {url}/approvals` opens an approval, `GET {url}/approvals/{id}` reads it.
pub struct HttpApprovalService {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApprovalService {
    pub fn new(config: &ServiceEndpointConfig) -> Result<Self, ExternalError> {
        if config.url.is_empty() {
            return Err(ExternalError::NotConfigured(
                "approval url is required".to_string(),
            ));
        }

        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: base_url(&config.url),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl ApprovalService for HttpApprovalService {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<String, ExternalError> {
        let url = format!("{}/approvals", self.base_url);
        debug!("Creating approval for ticket {}", request.ticket_id);

        let started = Instant::now();
        let result: Result<String, ExternalError> = async {
            let response = authorize(self.client.post(&url), self.token.as_deref())
                .json(request)
                .send()
                .await?;
            let response = check_status(response, "approval").await?;
            let created: CreateApprovalResponse = parse_json(response, "approval").await?;
            Ok(created.id)
        }
        .await;
        metrics::observe_external("approval", "create", started, &result);
        result
    }

    async fn get_approval_status(
        &self,
        approval_id: &str,
    ) -> Result<ApprovalStatus, ExternalError> {
        let url = format!("{}/approvals/{}", self.base_url, approval_id);

        let started = Instant::now();
        let result: Result<ApprovalStatus, ExternalError> = async {
            let response = authorize(self.client.get(&url), self.token.as_deref())
                .send()
                .await?;
            let response = check_status(response, approval_id).await?;
            parse_json(response, "approval status").await
        }
        .await;
        metrics::observe_external("approval", "status", started, &result);
        result
    }
}

/// Grants every approval immediately. Used when no approval service is configured.
#[derive(Debug, Default)]
pub struct AutoApproval;

#[async_trait]
impl ApprovalService for AutoApproval {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<String, ExternalError> {
        Ok(format!("auto-{}", request.ticket_id))
    }

    async fn get_approval_status(
        &self,
        _approval_id: &str,
    ) -> Result<ApprovalStatus, ExternalError> {
        let mut status = ApprovalStatus::finished(true);
        status.logs.push("approved automatically".to_string());
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ApprovalState;
    use serde_json::json;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            ticket_id: "t-1".to_string(),
            ticket_type: "cluster_apply".to_string(),
            tenant_id: "biz-1".to_string(),
            created_by: "alice".to_string(),
            details: json!({}),
        }
    }

    #[tokio::test]
    async fn test_auto_approval_grants() {
        let service = AutoApproval;
        let id = service.create_approval(&request()).await.unwrap();
        assert_eq!(id, "auto-t-1");

        let status = service.get_approval_status(&id).await.unwrap();
        assert_eq!(status.status, ApprovalState::Finished);
        assert_eq!(status.result, Some(true));
    }

    #[test]
    fn test_http_service_requires_url() {
        let config = ServiceEndpointConfig {
            url: String::new(),
            token: None,
            timeout_secs: 5,
        };
        assert!(matches!(
            HttpApprovalService::new(&config),
            Err(ExternalError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_http_service_unreachable_is_error() {
        let config = ServiceEndpointConfig {
            url: "http://127.0.0.1:1".to_string(),
            token: Some("secret".to_string()),
            timeout_secs: 1,
        };
        let service = HttpApprovalService::new(&config).unwrap();
        assert!(matches!(
            service.get_approval_status("a-1").await,
            Err(ExternalError::HttpError(_))
        ));
    }
}
