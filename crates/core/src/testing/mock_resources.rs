//! Mock resource service for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::external::{ExternalError, ResourceOutcome, ResourceRequest, ResourceService};

/// Mock implementation of the ResourceService trait.
///
/// Queued outcomes are returned first; afterwards every request is allocated
/// the configured default hosts.
#[derive(Debug)]
pub struct MockResourceService {
    outcomes: Arc<RwLock<VecDeque<ResourceOutcome>>>,
    default_hosts: Arc<RwLock<Vec<String>>>,
    requests: Arc<RwLock<Vec<ResourceRequest>>>,
    failures: Arc<RwLock<u32>>,
}

impl Default for MockResourceService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockResourceService {
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(RwLock::new(VecDeque::new())),
            default_hosts: Arc::new(RwLock::new(vec!["10.0.0.1".to_string()])),
            requests: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(RwLock::new(0)),
        }
    }

    /// Queue a shortage for the next request.
    pub async fn push_shortage(&self, message: &str) {
        self.outcomes
            .write()
            .await
            .push_back(ResourceOutcome::Shortage {
                message: message.to_string(),
            });
    }

    pub async fn push_outcome(&self, outcome: ResourceOutcome) {
        self.outcomes.write().await.push_back(outcome);
    }

    pub async fn set_default_hosts(&self, hosts: Vec<String>) {
        *self.default_hosts.write().await = hosts;
    }

    /// Make the next `count` calls fail.
    pub async fn fail_next(&self, count: u32) {
        *self.failures.write().await = count;
    }

    pub async fn requests(&self) -> Vec<ResourceRequest> {
        self.requests.read().await.clone()
    }
}

#[async_trait]
impl ResourceService for MockResourceService {
    async fn apply_resources(
        &self,
        request: &ResourceRequest,
    ) -> Result<ResourceOutcome, ExternalError> {
        {
            let mut failures = self.failures.write().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(ExternalError::ApiError {
                    status: 503,
                    message: "resource service unavailable".to_string(),
                });
            }
        }

        self.requests.write().await.push(request.clone());
        if let Some(outcome) = self.outcomes.write().await.pop_front() {
            return Ok(outcome);
        }

        let hosts = self.default_hosts.read().await.clone();
        let request_id = format!("req-{}", self.requests.read().await.len());
        Ok(ResourceOutcome::Allocated { request_id, hosts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_queued_shortage_then_default() {
        let mock = MockResourceService::new();
        mock.push_shortage("pool empty").await;

        let request = ResourceRequest {
            ticket_id: "t-1".to_string(),
            spec: json!({"count": 1}),
        };
        assert!(matches!(
            mock.apply_resources(&request).await.unwrap(),
            ResourceOutcome::Shortage { .. }
        ));
        assert_eq!(
            mock.apply_resources(&request).await.unwrap(),
            ResourceOutcome::Allocated {
                request_id: "req-2".to_string(),
                hosts: vec!["10.0.0.1".to_string()],
            }
        );
        assert_eq!(mock.requests().await.len(), 2);
    }
}
