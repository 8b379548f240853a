// SPDX-License-Identifier: MIT
//! Process lifecycle: serve until the listener exits or a termination signal
//! arrives, drain for a grace period, then tear telemetry down.
//!
//! ```text
//! Initializing ──spawn listener──▶ Running
//! Running ──listener exit | SIGINT/SIGTERM──▶ Draining ──grace──▶ Stopped
//! ```
//!
//! Whichever branch of the race completes first wins; the other is dropped
//! without being awaited. The grace period is a fixed sleep, not a barrier on
//! in-flight requests.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Time given to in-flight requests once draining starts.
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Draining,
    Stopped,
}

/// What moved the process from `Running` to `Draining`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainCause {
    /// The listener returned, with its error if it failed.
    ListenerExited(Option<String>),
    /// A termination signal, by name.
    Signal(&'static str),
}

pub struct Lifecycle {
    grace: Duration,
    phase: watch::Sender<Phase>,
}

impl Lifecycle {
    pub fn new(grace: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Initializing);
        Self { grace, phase }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Observe phase transitions.
    pub fn watch(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Phase) {
        tracing::debug!(?phase, "lifecycle transition");
        self.phase.send_replace(phase);
    }

    /// Run `server` on its own task and race it against `signal`.
    ///
    /// After the first of the two completes, waits out the grace period and
    /// then calls `shutdown`, logging its error.
    pub async fn run<S, E, G, F>(&self, server: S, signal: G, shutdown: F) -> DrainCause
    where
        S: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
        G: Future<Output = &'static str>,
        F: FnOnce() -> anyhow::Result<()>,
    {
        let listener = tokio::spawn(server);
        self.enter(Phase::Running);

        let cause = tokio::select! {
            joined = listener => match joined {
                Ok(Ok(())) => DrainCause::ListenerExited(None),
                Ok(Err(e)) => DrainCause::ListenerExited(Some(e.to_string())),
                Err(e) => DrainCause::ListenerExited(Some(e.to_string())),
            },
            name = signal => DrainCause::Signal(name),
        };

        match &cause {
            DrainCause::ListenerExited(Some(error)) => tracing::error!(%error, "Server failed"),
            DrainCause::ListenerExited(None) => tracing::info!("Server exited"),
            DrainCause::Signal(signal) => tracing::info!(signal, "Shutting down server"),
        }

        self.enter(Phase::Draining);
        tokio::time::sleep(self.grace).await;
        self.enter(Phase::Stopped);
        tracing::info!("Server stopped");

        if let Err(e) = shutdown() {
            tracing::error!(error = %e, "Failed to shutdown OpenTelemetry");
        }
        cause
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(GRACE_PERIOD)
    }
}

/// Resolve on SIGINT (Ctrl+C) or, on unix, SIGTERM.
///
/// A handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    }
}
