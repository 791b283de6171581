//! Mock approval service for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::external::{ApprovalRequest, ApprovalService, ApprovalStatus, ExternalError};

/// Mock implementation of the ApprovalService trait.
///
/// Approvals stay RUNNING until decided with [`MockApprovalService::decide`], unless a
/// default status is configured.
///
/// # Example
///
/// ```rust,ignore
/// let approvals = MockApprovalService::new();
/// let id = approvals.create_approval(&request).await?;
/// approvals.decide(&id, ApprovalStatus::finished(true)).await;
/// ```
#[derive(Debug, Default)]
pub struct MockApprovalService {
    created: Arc<RwLock<Vec<(String, ApprovalRequest)>>>,
    statuses: Arc<RwLock<HashMap<String, ApprovalStatus>>>,
    default_status: Arc<RwLock<Option<ApprovalStatus>>>,
    /// Calls left that fail with a 503.
    failures: Arc<RwLock<u32>>,
}

impl MockApprovalService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every approval is granted as soon as it is polled.
    pub fn approving() -> Self {
        Self {
            default_status: Arc::new(RwLock::new(Some(ApprovalStatus::finished(true)))),
            ..Self::default()
        }
    }

    /// Set the status reported for one approval.
    pub async fn decide(&self, approval_id: &str, status: ApprovalStatus) {
        self.statuses
            .write()
            .await
            .insert(approval_id.to_string(), status);
    }

    /// Status for approvals without an explicit decision.
    pub async fn set_default_status(&self, status: ApprovalStatus) {
        *self.default_status.write().await = Some(status);
    }

    /// Make the next `count` calls fail.
    pub async fn fail_next(&self, count: u32) {
        *self.failures.write().await = count;
    }

    /// Approvals created so far, with their ids.
    pub async fn created(&self) -> Vec<(String, ApprovalRequest)> {
        self.created.read().await.clone()
    }

    async fn take_failure(&self) -> Result<(), ExternalError> {
        let mut failures = self.failures.write().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(ExternalError::ApiError {
                status: 503,
                message: "approval service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ApprovalService for MockApprovalService {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<String, ExternalError> {
        self.take_failure().await?;
        let mut created = self.created.write().await;
        let id = format!("approval-{}", created.len() + 1);
        created.push((id.clone(), request.clone()));
        Ok(id)
    }

    async fn get_approval_status(
        &self,
        approval_id: &str,
    ) -> Result<ApprovalStatus, ExternalError> {
        self.take_failure().await?;
        if let Some(status) = self.statuses.read().await.get(approval_id) {
            return Ok(status.clone());
        }
        Ok(self
            .default_status
            .read()
            .await
            .clone()
            .unwrap_or_else(ApprovalStatus::running))
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
    async fn test_running_until_decided() {
        let mock = MockApprovalService::new();
        let id = mock.create_approval(&request()).await.unwrap();
        assert_eq!(
            mock.get_approval_status(&id).await.unwrap().status,
            ApprovalState::Running
        );

        mock.decide(&id, ApprovalStatus::with_state(ApprovalState::Revoked))
            .await;
        assert_eq!(
            mock.get_approval_status(&id).await.unwrap().status,
            ApprovalState::Revoked
        );
        assert_eq!(mock.created().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let mock = MockApprovalService::approving();
        mock.fail_next(1).await;
        assert!(mock.create_approval(&request()).await.is_err());
        let id = mock.create_approval(&request()).await.unwrap();
        assert_eq!(mock.get_approval_status(&id).await.unwrap().result, Some(true));
    }
}
