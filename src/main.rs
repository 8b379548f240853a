// SPDX-License-Identifier: MIT
use anyhow::Result;
use hello_otel::config::Config;
use hello_otel::lifecycle::{shutdown_signal, Lifecycle, GRACE_PERIOD};
use hello_otel::proxy::TrustedProxies;
use hello_otel::service::{app, AppState};
use hello_otel::telemetry::{
    console_subscriber, init_subscriber, init_telemetry, TelemetryHandle,
};
use std::net::SocketAddr;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    let lifecycle = Lifecycle::new(GRACE_PERIOD);

    // Telemetry failures are never fatal: the service runs uninstrumented.
    let built = tracing::subscriber::with_default(console_subscriber(), || {
        init_telemetry(&config.telemetry)
    });
    let (telemetry, init_error) = match built {
        Ok(handle) => (handle, None),
        Err(e) => (TelemetryHandle::disabled(), Some(e)),
    };
    init_subscriber(&telemetry)?;

    if let Some(e) = init_error {
        warn!(
            error = %format!("{e:#}"),
            "Failed to initialize OpenTelemetry, continuing without instrumentation"
        );
    }
    if telemetry.is_enabled() {
        info!("Starting application with OpenTelemetry enabled");
    } else {
        info!("Starting application (OpenTelemetry not configured)");
    }

    let proxies = match config.trusted_proxies() {
        Ok(proxies) => proxies,
        Err(e) => {
            error!(error = %e, "Invalid TRUSTED_PROXIES, trusting no proxy");
            TrustedProxies::None
        }
    };
    match &proxies {
        TrustedProxies::All => info!("Trusting all proxy networks"),
        TrustedProxies::None => info!("Disabled trusted proxies"),
        TrustedProxies::Networks(nets) => info!(proxies = ?nets, "Configured trusted proxies"),
    }

    let router = app(
        AppState::new(config.greeting.as_str()),
        telemetry.request_telemetry(),
        proxies,
    );

    let port = match config.listen_port() {
        Ok(port) => port,
        Err(e) => {
            error!(error = %e, "Cannot start server");
            if let Err(e) = telemetry.shutdown() {
                error!(error = %e, "Failed to shutdown OpenTelemetry");
            }
            return Ok(());
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(endpoint = %addr, "Starting server");

    let server = async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    };

    lifecycle
        .run(server, shutdown_signal(), move || telemetry.shutdown())
        .await;
    Ok(())
}
