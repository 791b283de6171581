//! Compute/host resource allocation.

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    authorize, base_url, build_client, check_status, parse_json, ExternalError, ResourceOutcome,
    ResourceRequest,
};
use crate::config::ResourcesConfig;
use crate::metrics;

/// Hands out hosts to tickets.
#[async_trait]
pub trait ResourceService: Send + Sync {
    /// Allocate hosts, or report a shortage.
    async fn apply_resources(
        &self,
        request: &ResourceRequest,
    ) -> Result<ResourceOutcome, ExternalError>;
}

#[derive(Debug, Deserialize)]
struct ShortageBody {
    #[serde(default)]
    message: String,
}

/// Resource service reached over HTTP.
///
/// `POST {url}/resources/apply`; a 409 answer is a shortage.
pub struct HttpResourceService {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpResourceService {
    pub fn new(url: &str, config: &ResourcesConfig) -> Result<Self, ExternalError> {
        if url.is_empty() {
            return Err(ExternalError::NotConfigured(
                "resources url is required".to_string(),
            ));
        }

        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: base_url(url),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl ResourceService for HttpResourceService {
    async fn apply_resources(
        &self,
        request: &ResourceRequest,
    ) -> Result<ResourceOutcome, ExternalError> {
        let url = format!("{}/resources/apply", self.base_url);
        debug!("Applying resources for ticket {}", request.ticket_id);

        let started = Instant::now();
        let result: Result<ResourceOutcome, ExternalError> = async {
            let response = authorize(self.client.post(&url), self.token.as_deref())
                .json(request)
                .send()
                .await?;

            if response.status() == 409 {
                let body: ShortageBody = parse_json(response, "shortage").await?;
                return Ok(ResourceOutcome::Shortage {
                    message: body.message,
                });
            }

            let response = check_status(response, "resources").await?;
            let allocated: AllocatedBody = parse_json(response, "allocation").await?;
            Ok(ResourceOutcome::Allocated {
                request_id: allocated.request_id,
                hosts: allocated.hosts,
            })
        }
        .await;
        metrics::observe_external("resources", "apply", started, &result);
        result
    }
}

#[derive(Debug, Deserialize)]
struct AllocatedBody {
    request_id: String,
    hosts: Vec<String>,
}

/// Fixed pool of hosts managed in-process.
///
/// Allocation takes hosts out of the pool; `replenish` puts new ones in.
#[derive(Debug, Default)]
pub struct StaticResourcePool {
    hosts: Mutex<Vec<String>>,
}

impl StaticResourcePool {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: Mutex::new(hosts.into_iter().map(Into::into).collect()),
        }
    }

    pub fn replenish<I, S>(&self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pool = self.hosts.lock().unwrap();
        pool.extend(hosts.into_iter().map(Into::into));
        info!("Resource pool replenished, {} hosts available", pool.len());
    }

    pub fn available(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }
}

#[async_trait]
impl ResourceService for StaticResourcePool {
    async fn apply_resources(
        &self,
        request: &ResourceRequest,
    ) -> Result<ResourceOutcome, ExternalError> {
        let wanted = request.count();
        let mut pool = self.hosts.lock().unwrap();
        if pool.len() < wanted {
            return Ok(ResourceOutcome::Shortage {
                message: format!("requested {} hosts, {} available", wanted, pool.len()),
            });
        }

        let hosts: Vec<String> = pool.drain(..wanted).collect();
        Ok(ResourceOutcome::Allocated {
            request_id: uuid::Uuid::new_v4().to_string(),
            hosts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(count: u64) -> ResourceRequest {
        ResourceRequest {
            ticket_id: "t-1".to_string(),
            spec: json!({ "count": count }),
        }
    }

    #[tokio::test]
    async fn test_static_pool_allocates_and_runs_short() {
        let pool = StaticResourcePool::new(["h1", "h2", "h3"]);

        match pool.apply_resources(&request(2)).await.unwrap() {
            ResourceOutcome::Allocated { hosts, .. } => assert_eq!(hosts, vec!["h1", "h2"]),
            other => panic!("expected allocation, got {:?}", other),
        }
        assert_eq!(pool.available(), 1);

        let outcome = pool.apply_resources(&request(2)).await.unwrap();
        assert!(matches!(outcome, ResourceOutcome::Shortage { .. }));
        assert_eq!(pool.available(), 1);

        pool.replenish(["h4"]);
        let outcome = pool.apply_resources(&request(2)).await.unwrap();
        assert!(matches!(outcome, ResourceOutcome::Allocated { .. }));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_http_service_requires_url() {
        assert!(matches!(
            HttpResourceService::new("", &ResourcesConfig::default()),
            Err(ExternalError::NotConfigured(_))
        ));
    }
}
