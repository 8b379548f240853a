// SPDX-License-Identifier: MIT
//! Telemetry initialization: traces, metrics and logs over OTLP, all or nothing.
//!
//! The public API is intentionally small:
//!
//! * [`init_telemetry`] – builds the three providers from a [`TelemetryConfig`].
//! * [`TelemetryHandle`] – owns the providers and their ordered teardown.
//! * [`ShutdownChain`] – teardown steps, used for rollback and for normal exit.
//! * [`init_subscriber`] – installs the `tracing` registry, bridged to OTLP when enabled.
//!
//! # Example
//! ```no_run
//! use hello_otel::config::TelemetryConfig;
//! use hello_otel::telemetry::{init_subscriber, init_telemetry};
//! fn main() -> anyhow::Result<()> {
//!     let handle = init_telemetry(&TelemetryConfig::default())?;
//!     init_subscriber(&handle)?;
//!     // ... application logic ...
//!     handle.shutdown()?; // ensure final batches exported
//!     Ok(())
//! }
//! ```
//!
//! # Initialization order
//! Tracer, meter, then logger provider. Each provider is installed and its
//! teardown registered in one step ([`ShutdownChain::register`]), so a failure
//! at step N shuts down exactly the providers of steps 1..N-1 before the error
//! is returned. A disabled configuration never touches the exporters.
//!
//! # Shutdown
//! Call [`TelemetryHandle::shutdown`] once, before the runtime exits. Teardown
//! runs in construction order and keeps going past failures; the last error is
//! returned.
//!
//! # Threading Model
//! Batch span/log processors and the periodic metric reader run on their own
//! SDK threads. HTTP exporters use the blocking client; gRPC exporters open a
//! lazy tonic channel, so [`init_telemetry`] must run inside a Tokio runtime
//! when `grpc` is selected.
use anyhow::{anyhow, Context, Result};
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider as _};
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{
    LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig, WithHttpConfig,
};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::sync::Arc;
use std::time::Duration;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::config::{OtlpProtocol, Propagator, TelemetryConfig};
use crate::middleware::{RequestMetrics, RequestTelemetry};

/// Instrumentation scope for the tracer and meter.
const SCOPE: &str = "hello-otel";

/// Matches the OTLP exporter's default export timeout.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

type Teardown = Box<dyn FnOnce() -> Result<()> + Send>;

/// Ordered list of provider teardown steps.
///
/// Steps run in the order they were registered. The chain is consumed by
/// [`ShutdownChain::shutdown`], so it can run at most once.
#[derive(Default)]
pub struct ShutdownChain {
    steps: Vec<(&'static str, Teardown)>,
}

impl ShutdownChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a teardown step.
    pub fn push<F>(&mut self, name: &'static str, step: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.steps.push((name, Box::new(step)));
    }

    /// Adopt the outcome of one provider build.
    ///
    /// On success the provider is handed to `install` and its shutdown is
    /// appended to the chain. On failure every step registered so far is run
    /// and the build error is returned, leaving the chain empty.
    pub fn register<P, I>(
        &mut self,
        name: &'static str,
        built: Result<P>,
        install: I,
    ) -> Result<P>
    where
        P: ProviderShutdown + Clone + Send + 'static,
        I: FnOnce(&P),
    {
        match built {
            Ok(provider) => {
                install(&provider);
                let handle = provider.clone();
                self.push(name, move || {
                    handle
                        .shutdown_provider()
                        .map_err(|e| anyhow!("{name}: {e}"))
                });
                Ok(provider)
            }
            Err(err) => {
                if let Err(rollback) = std::mem::take(self).shutdown() {
                    tracing::warn!(
                        error = %rollback,
                        "rollback of partially initialized telemetry failed"
                    );
                }
                Err(err)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in registration order, continuing past failures.
    ///
    /// Returns the last error seen, if any.
    pub fn shutdown(self) -> Result<()> {
        let mut outcome = Ok(());
        for (name, step) in self.steps {
            if let Err(e) = step() {
                tracing::error!(provider = name, error = %e, "telemetry shutdown step failed");
                outcome = Err(e);
            }
        }
        outcome
    }
}

/// Shutdown entry point shared by the SDK providers.
pub trait ProviderShutdown {
    fn shutdown_provider(&self) -> OTelSdkResult;
}

impl ProviderShutdown for SdkTracerProvider {
    fn shutdown_provider(&self) -> OTelSdkResult {
        self.shutdown()
    }
}

impl ProviderShutdown for SdkMeterProvider {
    fn shutdown_provider(&self) -> OTelSdkResult {
        self.shutdown()
    }
}

impl ProviderShutdown for SdkLoggerProvider {
    fn shutdown_provider(&self) -> OTelSdkResult {
        self.shutdown()
    }
}

/// Builds one provider per signal.
pub trait ProviderFactory {
    fn tracer_provider(
        &self,
        cfg: &TelemetryConfig,
        resource: &Resource,
    ) -> Result<SdkTracerProvider>;
    fn meter_provider(
        &self,
        cfg: &TelemetryConfig,
        resource: &Resource,
    ) -> Result<SdkMeterProvider>;
    fn logger_provider(
        &self,
        cfg: &TelemetryConfig,
        resource: &Resource,
    ) -> Result<SdkLoggerProvider>;
}

/// Wire transport for one signal's exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// OTLP/gRPC through tonic, at the base endpoint.
    Grpc { endpoint: String },
    /// OTLP/HTTP at `<endpoint>/v1/<signal>`.
    Http { protocol: Protocol, endpoint: String },
}

/// Pick the exporter transport for `signal` ("traces", "metrics" or "logs").
///
/// Certificate verification can only be skipped on the HTTP client, so an
/// insecure gRPC configuration is exported over `http/protobuf`.
pub fn transport(cfg: &TelemetryConfig, signal: &str) -> Transport {
    let protocol = match cfg.protocol {
        OtlpProtocol::Grpc if !cfg.insecure => {
            return Transport::Grpc {
                endpoint: cfg.base_endpoint().to_owned(),
            }
        }
        OtlpProtocol::Grpc => {
            tracing::warn!(
                signal,
                "insecure gRPC export is not supported, exporting over http/protobuf"
            );
            Protocol::HttpBinary
        }
        OtlpProtocol::HttpProtobuf => Protocol::HttpBinary,
        OtlpProtocol::HttpJson => Protocol::HttpJson,
    };
    Transport::Http {
        protocol,
        endpoint: cfg.signal_endpoint(signal),
    }
}

/// Source of the HTTP clients handed to exporters when `insecure` is set.
pub trait InsecureClients {
    /// Build a fresh client; called once per exporter.
    fn build(&self) -> Result<reqwest::blocking::Client>;
}

/// Blocking `reqwest` clients that skip certificate verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnverifiedTls;

impl InsecureClients for UnverifiedTls {
    fn build(&self) -> Result<reqwest::blocking::Client> {
        // the blocking client must not be built on an async runtime thread
        std::thread::spawn(|| {
            reqwest::blocking::Client::builder()
                .danger_accept_invalid_certs(true)
                .timeout(EXPORT_TIMEOUT)
                .build()
        })
        .join()
        .map_err(|_| anyhow!("http client builder thread panicked"))?
        .context("failed to build insecure http client")
    }
}

/// OTLP exporters over gRPC or HTTP, chosen by [`transport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OtlpExporters<C = UnverifiedTls> {
    clients: C,
}

impl OtlpExporters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: InsecureClients> OtlpExporters<C> {
    pub fn with_clients(clients: C) -> Self {
        Self { clients }
    }

    fn insecure_client(
        &self,
        cfg: &TelemetryConfig,
    ) -> Result<Option<reqwest::blocking::Client>> {
        if cfg.insecure {
            self.clients.build().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl<C: InsecureClients> ProviderFactory for OtlpExporters<C> {
    fn tracer_provider(
        &self,
        cfg: &TelemetryConfig,
        resource: &Resource,
    ) -> Result<SdkTracerProvider> {
        let exporter = match transport(cfg, "traces") {
            Transport::Grpc { endpoint } => SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?,
            Transport::Http { protocol, endpoint } => {
                let mut builder = SpanExporter::builder()
                    .with_http()
                    .with_protocol(protocol)
                    .with_endpoint(endpoint);
                if let Some(client) = self.insecure_client(cfg)? {
                    builder = builder.with_http_client(client);
                    tracing::info!(
                        "trace exporter configured with TLS certificate verification disabled"
                    );
                }
                builder.build()?
            }
        };

        Ok(SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource.clone())
            .build())
    }

    fn meter_provider(
        &self,
        cfg: &TelemetryConfig,
        resource: &Resource,
    ) -> Result<SdkMeterProvider> {
        let exporter = match transport(cfg, "metrics") {
            Transport::Grpc { endpoint } => MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?,
            Transport::Http { protocol, endpoint } => {
                let mut builder = MetricExporter::builder()
                    .with_http()
                    .with_protocol(protocol)
                    .with_endpoint(endpoint);
                if let Some(client) = self.insecure_client(cfg)? {
                    builder = builder.with_http_client(client);
                }
                builder.build()?
            }
        };

        Ok(SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter).build())
            .with_resource(resource.clone())
            .build())
    }

    fn logger_provider(
        &self,
        cfg: &TelemetryConfig,
        resource: &Resource,
    ) -> Result<SdkLoggerProvider> {
        let exporter = match transport(cfg, "logs") {
            Transport::Grpc { endpoint } => LogExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?,
            Transport::Http { protocol, endpoint } => {
                let mut builder = LogExporter::builder()
                    .with_http()
                    .with_protocol(protocol)
                    .with_endpoint(endpoint);
                if let Some(client) = self.insecure_client(cfg)? {
                    builder = builder.with_http_client(client);
                }
                builder.build()?
            }
        };

        Ok(SdkLoggerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource.clone())
            .build())
    }
}

/// Request counter and duration histogram.
///
/// An absent instrument is skipped at record time.
#[derive(Clone, Default)]
pub struct HttpInstruments {
    request_count: Option<Counter<u64>>,
    request_duration: Option<Histogram<f64>>,
}

impl HttpInstruments {
    pub fn new(meter: &Meter) -> Self {
        Self {
            request_count: Some(
                meter
                    .u64_counter("http.server.request.count")
                    .with_description("Number of HTTP requests received")
                    .with_unit("{request}")
                    .build(),
            ),
            request_duration: Some(
                meter
                    .f64_histogram("http.server.request.duration")
                    .with_description("Duration of HTTP requests")
                    .with_unit("ms")
                    .build(),
            ),
        }
    }
}

impl RequestMetrics for HttpInstruments {
    fn add_request(&self, attributes: &[KeyValue]) {
        if let Some(counter) = &self.request_count {
            counter.add(1, attributes);
        }
    }

    fn record_duration(&self, millis: f64, attributes: &[KeyValue]) {
        if let Some(histogram) = &self.request_duration {
            histogram.record(millis, attributes);
        }
    }
}

struct Providers {
    tracer: SdkTracerProvider,
    logger: SdkLoggerProvider,
}

/// Owns the active providers and their teardown.
///
/// A disabled handle holds nothing and shuts down as a no-op.
pub struct TelemetryHandle {
    providers: Option<Providers>,
    instruments: HttpInstruments,
    chain: ShutdownChain,
}

impl TelemetryHandle {
    pub fn disabled() -> Self {
        Self {
            providers: None,
            instruments: HttpInstruments::default(),
            chain: ShutdownChain::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.providers.is_some()
    }

    /// Context handed to the request middleware.
    pub fn request_telemetry(&self) -> RequestTelemetry {
        if self.is_enabled() {
            RequestTelemetry::enabled(Arc::new(self.instruments.clone()))
        } else {
            RequestTelemetry::disabled()
        }
    }

    /// Flush and shut down every provider in construction order.
    ///
    /// # Errors
    /// Returns the last provider error; earlier ones are logged.
    pub fn shutdown(self) -> Result<()> {
        self.chain.shutdown()
    }
}

fn install_propagators(propagators: &[Propagator]) {
    let propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>> = propagators
        .iter()
        .map(|p| -> Box<dyn TextMapPropagator + Send + Sync> {
            match p {
                Propagator::TraceContext => Box::new(TraceContextPropagator::new()),
                Propagator::Baggage => Box::new(BaggagePropagator::new()),
            }
        })
        .collect();
    global::set_text_map_propagator(TextMapCompositePropagator::new(propagators));
}

fn resource(cfg: &TelemetryConfig) -> Resource {
    Resource::builder()
        .with_service_name(cfg.service_name.clone())
        .with_attributes([
            KeyValue::new("service.version", cfg.service_version.clone()),
            KeyValue::new("deployment.environment", cfg.environment.clone()),
        ])
        .build()
}

/// Initialize OTLP traces, metrics and logs, or nothing when not configured.
///
/// # Errors
/// Returns an error if any exporter fails to build (e.g. invalid endpoint URL).
/// Providers built before the failure have already been shut down.
pub fn init_telemetry(cfg: &TelemetryConfig) -> Result<TelemetryHandle> {
    init_telemetry_with(cfg, &OtlpExporters::new())
}

/// [`init_telemetry`] with an explicit provider factory.
pub fn init_telemetry_with<F: ProviderFactory>(
    cfg: &TelemetryConfig,
    factory: &F,
) -> Result<TelemetryHandle> {
    if !cfg.is_enabled() {
        tracing::debug!(sdk_disabled = cfg.sdk_disabled, "OpenTelemetry not configured");
        return Ok(TelemetryHandle::disabled());
    }

    tracing::info!(
        endpoint = cfg.endpoint.as_deref().unwrap_or_default(),
        protocol = ?cfg.protocol,
        insecure = cfg.insecure,
        service_name = %cfg.service_name,
        "Initializing OpenTelemetry"
    );

    let resource = resource(cfg);
    install_propagators(&cfg.propagators);

    let mut chain = ShutdownChain::new();
    let tracer = chain.register(
        "tracer",
        factory
            .tracer_provider(cfg, &resource)
            .context("failed to create trace exporter"),
        |p| {
            global::set_tracer_provider(p.clone());
        },
    )?;
    let meter = chain.register(
        "meter",
        factory
            .meter_provider(cfg, &resource)
            .context("failed to create metric exporter"),
        |p| global::set_meter_provider(p.clone()),
    )?;
    // The logs API has no global registry; the provider reaches `tracing`
    // through the bridge layer in `init_subscriber`.
    let logger = chain.register(
        "logger",
        factory
            .logger_provider(cfg, &resource)
            .context("failed to create log exporter"),
        |_| {},
    )?;

    tracing::info!("OpenTelemetry initialized successfully");

    let instruments = HttpInstruments::new(&meter.meter(SCOPE));
    Ok(TelemetryHandle {
        providers: Some(Providers { tracer, logger }),
        instruments,
        chain,
    })
}

fn env_filter() -> EnvFilter {
    // exporter transports are silenced so their own events are never re-exported
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=off,h2=off,reqwest=off"))
}

/// Console-only subscriber, used while telemetry itself is being built.
pub fn console_subscriber() -> impl tracing::Subscriber + Send + Sync {
    fmt::Subscriber::builder()
        .with_env_filter(env_filter())
        .compact()
        .finish()
}

/// Install the global `tracing` subscriber.
///
/// Always logs to the console; when `handle` is enabled, spans are exported
/// through `tracing-opentelemetry` and events through the OTLP log bridge.
pub fn init_subscriber(handle: &TelemetryHandle) -> Result<()> {
    let otel_trace_layer = handle
        .providers
        .as_ref()
        .map(|p| OpenTelemetryLayer::new(p.tracer.tracer(SCOPE)));
    let bridge_layer = handle
        .providers
        .as_ref()
        .map(|p| OpenTelemetryTracingBridge::new(&p.logger));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .compact();

    Registry::default()
        .with(env_filter())
        .with(fmt_layer)
        .with(bridge_layer)
        .with(otel_trace_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}
