//! Request metrics and caller identity.

use axum::{
    body::Body,
    extract::FromRequestParts,
    http::{request::Parts, Request},
    middleware::Next,
    response::Response,
};
use std::future::Future;
use std::time::Instant;

use crate::metrics::{
    normalize_path, HTTP_REQUESTS_IN_FLIGHT, HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION,
};

/// Header naming the user behind a request.
pub const USER_HEADER: &str = "x-dbflow-user";

/// Metrics middleware that tracks HTTP request duration and counts.
///
/// This middleware records:
/// - Request duration (histogram)
/// - Request count (counter)
/// - Requests in flight (gauge)
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());

    HTTP_REQUESTS_IN_FLIGHT.inc();

    let response = next.run(request).await;

    HTTP_REQUESTS_IN_FLIGHT.dec();

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUEST_DURATION
        .with_label_values(&[&method, &path, &status])
        .observe(duration);
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();

    response
}

/// Extractor for the calling user, from the `x-dbflow-user` header.
///
/// Falls back to "anonymous", which is never a todo operator.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("anonymous")
            .to_string();
        std::future::ready(Ok(AuthUser(user)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, middleware, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn whoami(AuthUser(user): AuthUser) -> String {
        user
    }

    fn app() -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn(metrics_middleware))
    }

    async fn call(request: Request<Body>) -> (StatusCode, String) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_user_from_header() {
        let request = Request::builder()
            .uri("/whoami")
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(request).await, (StatusCode::OK, "alice".to_string()));
    }

    #[tokio::test]
    async fn test_missing_user_is_anonymous() {
        let request = Request::builder().uri("/whoami").body(Body::empty()).unwrap();
        assert_eq!(call(request).await, (StatusCode::OK, "anonymous".to_string()));

        let request = Request::builder()
            .uri("/whoami")
            .header(USER_HEADER, "  ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(request).await.1, "anonymous");
    }

    #[tokio::test]
    async fn test_requests_are_counted() {
        let request = Request::builder().uri("/whoami").body(Body::empty()).unwrap();
        call(request).await;

        let count = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/whoami", "200"])
            .get();
        assert!(count >= 1);
    }
}
