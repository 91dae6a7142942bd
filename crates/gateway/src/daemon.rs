//! Daemon startup and main loop for the gateway
//!
//! Wires the store, prober and supervisor together, starts enabled streams,
//! serves HTTP and stops every relay on shutdown.

use crate::api::{create_router, AppState};
use crate::config::{Config, ConfigError};
use crate::probe::HealthProber;
use crate::reconciler;
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{StoreError, StreamStore};
use crate::supervisor::StreamSupervisor;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Resource store could not be opened
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    pub store: Arc<StreamStore>,
    pub supervisor: Arc<StreamSupervisor>,
}

impl Daemon {
    /// Initialize the daemon
    ///
    /// This performs the full startup sequence:
    /// 1. Run startup checks (ffmpeg, ffprobe)
    /// 2. Open the resource store
    /// 3. Build the prober and the supervisor
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config).await
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when the external tools are not available.
    pub async fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let store = Arc::new(StreamStore::open(&config.store.data_dir).await?);
        let prober = HealthProber::from_config(&config.probe);
        let supervisor = Arc::new(StreamSupervisor::new(
            config.relay.clone(),
            prober,
            store.clone(),
        ));

        Ok(Self {
            config,
            store,
            supervisor,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.store.clone(), self.supervisor.clone())
    }

    /// Start every enabled stream. Returns `(started, failed)`.
    ///
    /// A stream that fails to start is logged and skipped.
    pub async fn start_enabled_streams(&self) -> (usize, usize) {
        let streams = self.store.list_enabled().await;
        let mut started = 0;
        let mut failed = 0;

        for stream in &streams {
            if self.supervisor.start(stream).await {
                started += 1;
            } else {
                error!(stream_id = stream.id, name = %stream.name, "Failed to start stream on startup");
                failed += 1;
            }
        }

        info!(started, failed, "Started enabled streams");
        (started, failed)
    }

    /// Spawn the background status refresher.
    ///
    /// Returns `None` when `probe.refresh_interval_secs` is 0.
    pub fn start_status_refresher(&self) -> Option<JoinHandle<()>> {
        if self.config.probe.refresh_interval_secs == 0 {
            return None;
        }

        let period = Duration::from_secs(self.config.probe.refresh_interval_secs);
        let store = self.store.clone();
        let supervisor = self.supervisor.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                for stream in store.list_enabled().await {
                    reconciler::refresh(&supervisor, &stream).await;
                }
            }
        }))
    }

    /// Serve HTTP on `listener` until `shutdown` resolves, then stop every relay.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let refresher = self.start_status_refresher();
        let app = create_router(self.app_state());

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| DaemonError::Server(e.to_string()));

        if let Some(handle) = refresher {
            handle.abort();
        }

        info!("Stopping all relays");
        let failures = self.supervisor.shutdown().await;
        if failures > 0 {
            warn!(failures, "Shutdown finished with relays that could not be stopped");
        }

        result
    }

    /// Run the daemon with all background tasks
    ///
    /// Starts enabled streams, binds the configured address and serves until
    /// Ctrl-C or SIGTERM.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        self.start_enabled_streams().await;

        let server = &self.config.server;
        let listener = TcpListener::bind((server.bind_address.as_str(), server.port))
            .await
            .map_err(|e| {
                DaemonError::Server(format!(
                    "Failed to bind {}:{}: {}",
                    server.bind_address, server.port, e
                ))
            })?;
        info!(address = %server.bind_address, port = server.port, "HTTP server listening");

        self.serve(listener, shutdown_signal()).await
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
