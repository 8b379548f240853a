// SPDX-License-Identifier: MIT
//! Route table and middleware stack.

use axum::{extract::State, middleware, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::middleware::{attach_client_ip, track_requests, ClientIp, RequestTelemetry};
use crate::proxy::TrustedProxies;

/// State injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub greeting: Arc<str>,
}

impl AppState {
    pub fn new(greeting: impl Into<Arc<str>>) -> Self {
        Self {
            greeting: greeting.into(),
        }
    }
}

#[derive(Serialize)]
struct Message {
    message: String,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn root(State(state): State<AppState>, ClientIp(client_ip): ClientIp) -> Json<Message> {
    tracing::info!(client_ip = ?client_ip, "Handling root request");
    Json(Message {
        message: state.greeting.to_string(),
    })
}

async fn health(ClientIp(client_ip): ClientIp) -> Json<Health> {
    tracing::info!(client_ip = ?client_ip, "Health check requested");
    Json(Health { status: "healthy" })
}

/// Build the application router.
///
/// Outermost first: panic recovery, access log, client IP resolution,
/// request telemetry, routes.
pub fn app(state: AppState, telemetry: RequestTelemetry, proxies: TrustedProxies) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(telemetry, track_requests))
        .layer(middleware::from_fn_with_state(Arc::new(proxies), attach_client_ip))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}
