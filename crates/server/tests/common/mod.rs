//! Common test utilities for HTTP API testing with mocks.
//!
//! This module provides a test fixture that builds the router around an
//! in-memory manager stack, so requests go through the real handlers without
//! binding a socket or calling external services.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use dbflow_core::{
    audit::{create_audit_system, AuditStore, SqliteAuditStore},
    pipeline::ActivityStep,
    testing::{ScriptedActivity, TestStack},
    Config, FlowTemplate, FlowType, TicketTypeDefinition, TicketTypeRegistry,
};
use dbflow_server::{api::create_router, api::middleware::USER_HEADER, state::AppState};

/// Re-export fixtures for test convenience
pub use dbflow_core::testing::fixtures;

/// Test fixture for API testing with mock dependencies.
///
/// Registers one ticket type, `db_change`: approval, pause (operator alice),
/// an inner pipeline of one `apply` step, and delivery.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_ticket_creation() {
///     let fixture = TestFixture::new().await;
///
///     let response = fixture.post("/api/v1/tickets", "bob", json!({
///         "ticket_type": "db_change",
///         "tenant_id": "tenant-a",
///         "details": {"cluster_id": "c-1"}
///     })).await;
///
///     assert_eq!(response.status, 201);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    /// Manager stack with mock approval and resource services
    pub stack: TestStack,
    /// The pipeline's only activity
    pub apply: Arc<ScriptedActivity>,
    pub audit_store: Arc<dyn AuditStore>,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    pub async fn new() -> Self {
        let apply = Arc::new(ScriptedActivity::new("apply").mutating());

        let registry = TicketTypeRegistry::new()
            .register(
                TicketTypeDefinition::new("db_change")
                    .flow(FlowTemplate::new(FlowType::Approval, "approval"))
                    .flow(
                        FlowTemplate::new(FlowType::Pause, "confirm")
                            .with_details(json!({"operators": ["alice"]})),
                    )
                    .flow(FlowTemplate::new(FlowType::Inner, "apply"))
                    .flow(FlowTemplate::new(FlowType::Delivery, "deliver"))
                    .with_validator(|details| match details.get("cluster_id") {
                        Some(Value::String(_)) => Ok(()),
                        _ => Err("cluster_id is required".to_string()),
                    })
                    .with_pipeline(|builder| {
                        let cluster = builder.context().details["cluster_id"].clone();
                        builder
                            .add_step(ActivityStep::new(
                                "apply",
                                "apply",
                                json!({"cluster_id": cluster}),
                            ))
                            .build()
                    }),
            )
            .expect("Failed to register ticket type");

        let audit_store: Arc<dyn AuditStore> =
            Arc::new(SqliteAuditStore::in_memory().expect("Failed to create audit store"));
        let (audit_handle, audit_writer) = create_audit_system(Arc::clone(&audit_store), 100);
        tokio::spawn(audit_writer.run());

        let stack = TestStack::builder()
            .registry(registry)
            .activity(apply.clone())
            .audit(audit_handle)
            .build();
        stack.manager.start().await;

        let state = Arc::new(AppState::new(
            Config::default(),
            stack.manager.clone(),
            Arc::clone(&audit_store),
        ));
        let router = create_router(state);

        Self {
            router,
            stack,
            apply,
            audit_store,
        }
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None, None).await
    }

    /// Send a POST request with JSON body as `user`.
    pub async fn post(&self, path: &str, user: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(user), Some(body)).await
    }

    /// Send a POST request without a body as `user`.
    pub async fn post_empty(&self, path: &str, user: &str) -> TestResponse {
        self.request("POST", path, Some(user), None).await
    }

    /// Send a GET request and return the raw text body.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    /// Submit a `db_change` ticket as bob and return its id.
    pub async fn submit(&self, cluster: &str) -> String {
        let response = self
            .post(
                "/api/v1/tickets",
                "bob",
                json!({
                    "ticket_type": "db_change",
                    "tenant_id": "tenant-a",
                    "details": {"cluster_id": cluster}
                }),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        response.body["id"]
            .as_str()
            .expect("ticket id should be a string")
            .to_string()
    }

    /// Send a request to the test server.
    async fn request(
        &self,
        method: &str,
        path: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        if let Some(user) = user {
            request_builder = request_builder.header(USER_HEADER, user);
        }

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}
