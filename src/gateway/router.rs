//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::warn;

use super::auth::{AuthState, auth_middleware};
use super::proxy::{ReverseProxy, proxy_handler};

/// Create the router for one listener.
///
/// `/healthz` is open; every other path is authenticated and proxied.
pub fn create_router(proxy: Arc<ReverseProxy>, auth: AuthState, request_timeout: Duration) -> Router {
    let proxied = Router::new()
        .route("/", any(proxy_handler))
        .route("/{*path}", any(proxy_handler))
        // Authentication only guards matched proxy routes
        .route_layer(middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(proxy);

    Router::new()
        .route("/healthz", get(health_handler))
        .merge(proxied)
        .layer(middleware::from_fn_with_state(request_timeout, deadline_middleware))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// GET /healthz
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// Global per-request deadline.
///
/// Dropping the inner future cancels the in-flight upstream call.
async fn deadline_middleware(
    State(timeout): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match tokio::time::timeout(timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(path = %path, timeout_ms = timeout.as_millis(), "Request exceeded deadline");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "error": "request timed out" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::proxy::RouteTable;
    use crate::identity::TokenVerifier;
    use axum::body::Body;
    use tower::ServiceExt;

    fn router() -> Router {
        let proxy = ReverseProxy::new(RouteTable::new(Vec::new()), None, Duration::from_secs(5)).unwrap();
        create_router(
            Arc::new(proxy),
            AuthState::public(Arc::new(TokenVerifier::TrustAll)),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_healthz_needs_no_credentials() {
        let response = router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_unknown_path_requires_auth_then_404() {
        let response = router()
            .oneshot(Request::builder().uri("/v9/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/v9/nothing")
                    .header("authorization", "Bearer alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_deadline_returns_504() {
        async fn slow() -> &'static str {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        }

        let app = Router::new()
            .route("/slow", get(slow))
            .layer(middleware::from_fn_with_state(
                Duration::from_millis(50),
                deadline_middleware,
            ));

        let response = app
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
