//! Ops server — read-only Axum surface for operators.
//!
//! Serves the schedule, per-provider quota state, stream stats, and the
//! recent tick log as JSON. CORS is GET-only; nothing here mutates the
//! engine.

pub mod routes;

pub use routes::OpsState;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use tracing::{error, info};

use routes::AppState;

/// Start the ops web server on a background task. Does not block.
pub fn spawn_ops(state: AppState, port: u16) {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!(port, "Ops server starting on http://localhost:{port}");

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, error = %e, "Failed to bind ops port");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Ops server error");
        }
    });
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin("*".parse::<HeaderValue>().expect("static origin"))
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/schedule", get(routes::get_schedule))
        .route("/api/limits", get(routes::get_limits))
        .route("/api/stream", get(routes::get_stream))
        .route("/api/ticks", get(routes::get_ticks))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        Arc::new(OpsState::new())
    }

    async fn get_ok(uri: &str) -> serde_json::Value {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_schedule_endpoint_empty_state() {
        let json = get_ok("/api/schedule").await;
        assert!(json["categories"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_limits_endpoint_empty_state() {
        let json = get_ok("/api/limits").await;
        assert!(json["providers"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_endpoint_shape() {
        let json = get_ok("/api/stream").await;
        assert_eq!(json["attached"], 0);
        assert_eq!(json["cooldown_secs"], 0);
    }

    #[tokio::test]
    async fn test_ticks_endpoint_empty_state() {
        let json = get_ok("/api/ticks").await;
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
