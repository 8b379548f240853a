// SPDX-License-Identifier: MIT
//! Process configuration read from the environment.
//!
//! Reading never fails: every option resolves to a documented default. The two
//! options that can be malformed (`PORT` and `TRUSTED_PROXIES`) are kept raw
//! and validated on demand by [`Config::listen_port`] and
//! [`Config::trusted_proxies`], so the caller decides what is fatal.

use crate::proxy::TrustedProxies;

/// Service name used when `OTEL_SERVICE_NAME` is unset.
pub const DEFAULT_SERVICE_NAME: &str = "hello-otel";

/// Message returned by `GET /` when `GREETING` is unset.
pub const DEFAULT_GREETING: &str = "Hot reload is working FOR REALZ! 🎉🔥";

/// Errors raised while validating configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable PORT is not set")]
    MissingPort,
    #[error("PORT {value:?} is not a valid port number: {source}")]
    InvalidPort {
        value: String,
        source: std::num::ParseIntError,
    },
    #[error("trusted proxy {0:?} is not an IP address or CIDR network")]
    InvalidNetwork(String),
}

/// OTLP transport selected through `OTEL_EXPORTER_OTLP_PROTOCOL`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OtlpProtocol {
    /// `http/protobuf`
    #[default]
    HttpProtobuf,
    /// `http/json`
    HttpJson,
    /// `grpc`, exported through tonic at the base endpoint.
    Grpc,
}

impl OtlpProtocol {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http/json" => Self::HttpJson,
            "grpc" => Self::Grpc,
            _ => Self::HttpProtobuf,
        }
    }
}

/// Text-map propagator named in `OTEL_PROPAGATORS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagator {
    TraceContext,
    Baggage,
}

fn parse_propagators(raw: Option<&str>) -> Vec<Propagator> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return vec![Propagator::TraceContext, Propagator::Baggage];
    };
    let mut out = Vec::new();
    for name in raw.split(',').map(|n| n.trim().to_ascii_lowercase()) {
        let propagator = match name.as_str() {
            "none" => return Vec::new(),
            "tracecontext" => Propagator::TraceContext,
            "baggage" => Propagator::Baggage,
            // b3, jaeger etc. have no propagator linked in this build
            _ => continue,
        };
        if !out.contains(&propagator) {
            out.push(propagator);
        }
    }
    out
}

fn is_true(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Telemetry settings derived from the standard `OTEL_*` variables.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Base OTLP endpoint (without per-signal suffix). `None` disables telemetry.
    pub endpoint: Option<String>,
    /// `OTEL_SDK_DISABLED=true` wins over a configured endpoint.
    pub sdk_disabled: bool,
    pub protocol: OtlpProtocol,
    /// Skip certificate verification on every exporter.
    pub insecure: bool,
    /// Service name reported in resource attributes (`service.name`).
    pub service_name: String,
    /// Service version reported in resource attributes (`service.version`).
    pub service_version: String,
    /// Deployment environment reported as `deployment.environment`.
    pub environment: String,
    pub propagators: Vec<Propagator>,
}

impl TelemetryConfig {
    /// True when an endpoint is configured and the SDK is not explicitly disabled.
    pub fn is_enabled(&self) -> bool {
        !self.sdk_disabled && self.endpoint.is_some()
    }

    /// Configured endpoint without a trailing slash; gRPC exporters use it as is.
    pub fn base_endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_default()
            .trim_end_matches('/')
    }

    /// Per-signal OTLP/HTTP endpoint, e.g. `signal_endpoint("traces")`.
    pub fn signal_endpoint(&self, signal: &str) -> String {
        format!("{}/v1/{signal}", self.base_endpoint())
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Config::from_env().telemetry
    }
}

/// Immutable snapshot of every environment-derived setting.
#[derive(Clone, Debug)]
pub struct Config {
    pub telemetry: TelemetryConfig,
    /// Raw `TRUSTED_PROXIES` value.
    pub trusted_proxies: Option<String>,
    /// Raw `PORT` value.
    pub port: Option<String>,
    pub greeting: String,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    ///
    /// Empty values are treated the same as unset ones.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let telemetry = TelemetryConfig {
            endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
            sdk_disabled: is_true(get("OTEL_SDK_DISABLED").as_deref()),
            protocol: get("OTEL_EXPORTER_OTLP_PROTOCOL")
                .map(|p| OtlpProtocol::parse(&p))
                .unwrap_or_default(),
            insecure: is_true(get("OTEL_EXPORTER_OTLP_INSECURE").as_deref()),
            service_name: get("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: get("RUST_ENV").unwrap_or_else(|| "dev".into()),
            propagators: parse_propagators(get("OTEL_PROPAGATORS").as_deref()),
        };

        Self {
            telemetry,
            trusted_proxies: get("TRUSTED_PROXIES"),
            port: get("PORT"),
            greeting: get("GREETING").unwrap_or_else(|| DEFAULT_GREETING.to_string()),
        }
    }

    /// Validate `PORT`.
    pub fn listen_port(&self) -> Result<u16, ConfigError> {
        let raw = self.port.as_deref().ok_or(ConfigError::MissingPort)?;
        raw.trim()
            .parse()
            .map_err(|source| ConfigError::InvalidPort {
                value: raw.to_string(),
                source,
            })
    }

    /// Parse `TRUSTED_PROXIES`: `all`, empty, or a `;`-delimited network list.
    pub fn trusted_proxies(&self) -> Result<TrustedProxies, ConfigError> {
        TrustedProxies::parse(self.trusted_proxies.as_deref().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_disable_telemetry() {
        let cfg = config(&[]);
        assert!(!cfg.telemetry.is_enabled());
        assert_eq!(cfg.telemetry.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(cfg.telemetry.environment, "dev");
        assert_eq!(cfg.telemetry.protocol, OtlpProtocol::HttpProtobuf);
        assert!(!cfg.telemetry.insecure);
        assert_eq!(
            cfg.telemetry.propagators,
            vec![Propagator::TraceContext, Propagator::Baggage]
        );
        assert_eq!(cfg.greeting, DEFAULT_GREETING);
    }

    #[test]
    fn endpoint_enables_unless_sdk_disabled() {
        let enabled = config(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318")]);
        assert!(enabled.telemetry.is_enabled());

        let disabled = config(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318"),
            ("OTEL_SDK_DISABLED", "TRUE"),
        ]);
        assert!(!disabled.telemetry.is_enabled());

        let empty = config(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "")]);
        assert!(!empty.telemetry.is_enabled());
    }

    #[test]
    fn signal_endpoint_appends_path_once() {
        let cfg = config(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "https://collector:4318/")]);
        assert_eq!(
            cfg.telemetry.signal_endpoint("metrics"),
            "https://collector:4318/v1/metrics"
        );
        assert_eq!(cfg.telemetry.base_endpoint(), "https://collector:4318");
    }

    #[test]
    fn insecure_and_protocol_flags() {
        let cfg = config(&[
            ("OTEL_EXPORTER_OTLP_INSECURE", "true"),
            ("OTEL_EXPORTER_OTLP_PROTOCOL", "http/json"),
            ("OTEL_SERVICE_NAME", "frontend"),
        ]);
        assert!(cfg.telemetry.insecure);
        assert_eq!(cfg.telemetry.protocol, OtlpProtocol::HttpJson);
        assert_eq!(cfg.telemetry.service_name, "frontend");

        let cfg = config(&[
            ("OTEL_EXPORTER_OTLP_INSECURE", "yes"),
            ("OTEL_EXPORTER_OTLP_PROTOCOL", "grpc"),
        ]);
        assert!(!cfg.telemetry.insecure);
        assert_eq!(cfg.telemetry.protocol, OtlpProtocol::Grpc);
    }

    #[test]
    fn propagator_list() {
        assert!(config(&[("OTEL_PROPAGATORS", "none")])
            .telemetry
            .propagators
            .is_empty());
        assert_eq!(
            config(&[("OTEL_PROPAGATORS", "baggage, b3, baggage")])
                .telemetry
                .propagators,
            vec![Propagator::Baggage]
        );
    }

    #[test]
    fn port_is_validated() {
        assert!(matches!(
            config(&[]).listen_port(),
            Err(ConfigError::MissingPort)
        ));
        assert!(matches!(
            config(&[("PORT", "eighty")]).listen_port(),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert!(matches!(
            config(&[("PORT", "70000")]).listen_port(),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert_eq!(config(&[("PORT", "8080")]).listen_port().unwrap(), 8080);
    }

    #[test]
    fn trusted_proxies_default_to_none() {
        assert_eq!(config(&[]).trusted_proxies().unwrap(), TrustedProxies::None);
        assert_eq!(
            config(&[("TRUSTED_PROXIES", "all")]).trusted_proxies().unwrap(),
            TrustedProxies::All
        );
    }
}
