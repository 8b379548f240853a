// SPDX-License-Identifier: MIT
//! Per-request instrumentation and client IP resolution.

use axum::{
    extract::{ConnectInfo, FromRequestParts, MatchedPath, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use opentelemetry::{global, KeyValue};
use opentelemetry_http::HeaderExtractor;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::proxy::TrustedProxies;

/// Sink for the measurements taken once per request.
pub trait RequestMetrics: Send + Sync {
    /// Count one handled request.
    fn add_request(&self, attributes: &[KeyValue]);
    /// Record the wall-clock handling time in milliseconds.
    fn record_duration(&self, millis: f64, attributes: &[KeyValue]);
}

/// Telemetry context shared by every request, fixed once the server starts.
#[derive(Clone)]
pub struct RequestTelemetry {
    enabled: bool,
    metrics: Arc<dyn RequestMetrics>,
}

struct NoMetrics;

impl RequestMetrics for NoMetrics {
    fn add_request(&self, _: &[KeyValue]) {}
    fn record_duration(&self, _: f64, _: &[KeyValue]) {}
}

impl RequestTelemetry {
    pub fn enabled(metrics: Arc<dyn RequestMetrics>) -> Self {
        Self {
            enabled: true,
            metrics,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            metrics: Arc::new(NoMetrics),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Open a server span around the handler and record request metrics.
///
/// Pass-through when telemetry is disabled.
pub async fn track_requests(
    State(telemetry): State<RequestTelemetry>,
    req: Request,
    next: Next,
) -> Response {
    if !telemetry.enabled {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_default();
    let parent =
        global::get_text_map_propagator(|p| p.extract(&HeaderExtractor(req.headers())));

    let name = format!("{method} {route}");
    let span = tracing::info_span!(
        "request",
        otel.name = %name,
        otel.kind = "server",
        http.request.method = %method,
        http.route = %route,
        http.response.status_code = tracing::field::Empty,
    );
    if let Err(e) = span.set_parent(parent) {
        tracing::debug!(error = ?e, "request span did not adopt the propagated context");
    }

    let start = Instant::now();
    let response = next.run(req).instrument(span.clone()).await;
    let elapsed = start.elapsed().as_secs_f64() * 1000.0;

    let status = response.status().as_u16();
    span.record("http.response.status_code", status);

    let attributes = [
        KeyValue::new("http.method", method),
        KeyValue::new("http.route", route),
        KeyValue::new("http.status_code", status.to_string()),
    ];
    telemetry.metrics.add_request(&attributes);
    telemetry.metrics.record_duration(elapsed, &attributes);

    response
}

/// Client address after applying the trusted proxy rules.
///
/// `None` when the connection's peer address is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<ClientIp>()
            .copied()
            .unwrap_or(ClientIp(None)))
    }
}

/// Resolve the client IP from the peer address and forwarding headers.
pub async fn attach_client_ip(
    State(proxies): State<Arc<TrustedProxies>>,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    if let Some(peer) = peer {
        let client = proxies.client_ip(peer, req.headers());
        req.extensions_mut().insert(ClientIp(Some(client)));
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Counting {
        counts: AtomicUsize,
        durations: AtomicUsize,
        attributes: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl RequestMetrics for Counting {
        fn add_request(&self, attributes: &[KeyValue]) {
            self.counts.fetch_add(1, Ordering::SeqCst);
            self.attributes.lock().unwrap().push(
                attributes
                    .iter()
                    .map(|kv| (kv.key.as_str().to_owned(), kv.value.as_str().into_owned()))
                    .collect(),
            );
        }

        fn record_duration(&self, millis: f64, _attributes: &[KeyValue]) {
            assert!(millis >= 0.0);
            self.durations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn app(telemetry: RequestTelemetry) -> Router {
        Router::new()
            .route("/items/{id}", get(|| async { "item" }))
            .layer(axum::middleware::from_fn_with_state(telemetry, track_requests))
    }

    async fn send(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn disabled_telemetry_records_nothing() {
        let metrics = Arc::new(Counting::default());
        let telemetry = RequestTelemetry {
            enabled: false,
            metrics: metrics.clone(),
        };

        assert_eq!(send(app(telemetry), "/items/7").await, StatusCode::OK);
        assert_eq!(metrics.counts.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.durations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn records_once_per_request_with_route_template() {
        let metrics = Arc::new(Counting::default());
        let telemetry = RequestTelemetry::enabled(metrics.clone());

        assert_eq!(send(app(telemetry), "/items/7").await, StatusCode::OK);
        assert_eq!(metrics.counts.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.durations.load(Ordering::SeqCst), 1);
        assert_eq!(
            metrics.attributes.lock().unwrap()[0],
            [
                ("http.method", "GET"),
                ("http.route", "/items/{id}"),
                ("http.status_code", "200"),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string()))
        );
    }

    #[tokio::test]
    async fn unmatched_route_records_final_status() {
        let metrics = Arc::new(Counting::default());
        let telemetry = RequestTelemetry::enabled(metrics.clone());

        assert_eq!(send(app(telemetry), "/nope").await, StatusCode::NOT_FOUND);
        let recorded = metrics.attributes.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0][1], ("http.route".into(), String::new()));
        assert_eq!(recorded[0][2], ("http.status_code".into(), "404".into()));
    }

    #[tokio::test]
    async fn request_span_continues_incoming_trace() {
        use opentelemetry::trace::{TraceContextExt as _, TracerProvider as _};
        use opentelemetry_sdk::propagation::TraceContextPropagator;
        use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
        use tracing_subscriber::layer::SubscriberExt;

        global::set_text_map_propagator(TraceContextPropagator::new());
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::OpenTelemetryLayer::new(provider.tracer("test")));
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = Router::new()
            .route(
                "/items/{id}",
                get(|| async {
                    tracing::Span::current()
                        .context()
                        .span()
                        .span_context()
                        .trace_id()
                        .to_string()
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                RequestTelemetry::enabled(Arc::new(Counting::default())),
                track_requests,
            ));
        let req = Request::builder()
            .uri("/items/7")
            .header(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            )
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"4bf92f3577b34da6a3ce929d0e0e4736");

        let spans = exporter.get_finished_spans().unwrap();
        let span = spans
            .iter()
            .find(|s| s.name == "GET /items/{id}")
            .expect("request span exported");
        assert_eq!(
            span.span_context.trace_id().to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert_eq!(span.parent_span_id.to_string(), "00f067aa0ba902b7");
        let status = span
            .attributes
            .iter()
            .find(|kv| kv.key.as_str() == "http.response.status_code")
            .map(|kv| kv.value.as_str().into_owned());
        assert_eq!(status.as_deref(), Some("200"));
    }

    #[tokio::test]
    async fn client_ip_comes_from_connect_info() {
        let app = Router::new()
            .route(
                "/",
                get(|ClientIp(ip): ClientIp| async move {
                    ip.map(|ip| ip.to_string()).unwrap_or_default()
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                Arc::new(TrustedProxies::All),
                attach_client_ip,
            ));

        let mut req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 5000))));

        let response = app.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"203.0.113.7");
    }
}
