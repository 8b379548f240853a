// SPDX-License-Identifier: MIT
//! A "Hello World" HTTP service with conditional OpenTelemetry instrumentation.
//!
//! Telemetry is all or nothing:
//! * Traces, metrics and logs are exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! * Nothing is exported when the endpoint is unset or `OTEL_SDK_DISABLED=true`.
//! * Any exporter failure rolls back what was built and the service runs uninstrumented.
//!
//! Modules, leaves first: [`config`] reads the environment, [`proxy`] resolves
//! client addresses, [`telemetry`] builds and tears down providers,
//! [`middleware`] instruments requests, [`service`] holds the routes and
//! [`lifecycle`] runs the server until it exits or is signalled.
//!
//! # Quick Start
//! ```no_run
//! use hello_otel::config::Config;
//! use hello_otel::telemetry::{init_subscriber, init_telemetry};
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env();
//!     let handle = init_telemetry(&config.telemetry)?;
//!     init_subscriber(&handle)?;
//!     // business logic
//!     handle.shutdown()?;
//!     Ok(())
//! }
//! ```
pub mod config;
pub mod lifecycle;
pub mod middleware;
pub mod proxy;
pub mod service;
pub mod telemetry;
