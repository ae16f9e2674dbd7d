//! Health and metrics HTTP endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};

use crate::env;

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => Response::builder()
            .header("Content-Type", encoder.format_type())
            .body(buffer.into())
            .unwrap_or_else(|_| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create response for metrics",
                )
                    .into_response()
            }),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to collect metrics",
        )
            .into_response(),
    }
}

pub fn spawn(registry: Registry) {
    let registry = Arc::new(registry);
    tokio::spawn(async move {
        let app = Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_handler))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(registry);

        let addr = env::SERVICE_BIND_TO_ADDR.default(SocketAddr::from(([0, 0, 0, 0], 8080)));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to bind metrics server to {addr}: {e}");
                return;
            }
        };
        tracing::info!("Starting service endpoints at {addr:?}");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server failed: {e}");
        }
    });
}
