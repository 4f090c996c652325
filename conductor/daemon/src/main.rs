//! Conductor Daemon - Conversation Server
//!
//! Hosts one Conductor behind a Unix socket. Clients send length-prefixed
//! `ClientEvent` frames (`ask`, `abort`) and receive `ConductorMessage`
//! frames.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/conductor/conductor.toml if present)
//! conductor-daemon
//!
//! # Custom socket and backend
//! conductor-daemon --socket /tmp/conductor.sock --backend-url http://localhost:8000
//!
//! # Ephemeral storage
//! conductor-daemon --in-memory
//!
//! # Verbose logging
//! RUST_LOG=debug conductor-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use conductor_core::config::{load_config, load_config_from_path};
use conductor_core::{
    ChatBackend, Conductor, ConfigOverrides, ConversationStore, FileStore, MemoryStore,
    OpenAiCompatBackend,
};

use server::DaemonServer;

/// Conductor Daemon - conversation server for OpenAI-compatible backends
#[derive(Parser, Debug)]
#[command(name = "conductor-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "CONDUCTOR_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Unix socket path for client connections
    #[arg(short = 's', long = "socket", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Model identifier sent to the backend
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Base URL of the completion server
    #[arg(short = 'b', long, value_name = "URL")]
    backend_url: Option<String>,

    /// Directory for conversation files
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Keep conversations in memory only
    #[arg(long)]
    in_memory: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CONDUCTOR_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref path) = self.socket_path {
            overrides = overrides.with_socket_path(path.clone());
        }
        if let Some(ref model) = self.model {
            overrides = overrides.with_model(model.clone());
        }
        if let Some(ref url) = self.backend_url {
            overrides = overrides.with_backend_url(url.clone());
        }
        if let Some(ref dir) = self.data_dir {
            overrides = overrides.with_data_dir(dir.clone());
        }
        if self.in_memory {
            overrides = overrides.with_in_memory(true);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "conductor_daemon={level},conductor_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .init();
}

/// Resolves on SIGTERM or SIGINT
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

/// Fire `stop_tx` once `signal` resolves
///
/// If the signal handlers cannot be installed this never returns, so the
/// server keeps running instead of seeing a dropped sender.
async fn forward_shutdown<F>(signal: F, stop_tx: oneshot::Sender<()>)
where
    F: Future<Output = Result<()>>,
{
    if let Err(e) = signal.await {
        error!(error = %e, "Signal handling failed; the daemon must be stopped by other means");
        std::future::pending::<()>().await;
    }
    let _ = stop_tx.send(());
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Conductor Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match args.config {
        Some(ref path) => load_config_from_path(Some(path.clone())),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    info!(source = ?config.source(), "Configuration loaded");

    let conductor_config = config
        .conductor_config()
        .context("Invalid configuration")?;

    let backend: Arc<dyn ChatBackend> = Arc::new(
        OpenAiCompatBackend::new(config.backend.clone()).context("Failed to create backend")?,
    );
    if !backend.health_check().await {
        warn!(url = %config.backend.base_url, "Backend is not reachable yet");
    }

    let store: Arc<dyn ConversationStore> = if config.in_memory {
        info!("Using in-memory storage");
        Arc::new(MemoryStore::new())
    } else {
        let store = FileStore::new(&config.data_dir);
        store
            .init()
            .await
            .with_context(|| format!("Failed to initialize storage at {:?}", config.data_dir))?;
        info!(data_dir = ?config.data_dir, "Using file storage");
        Arc::new(store)
    };

    let conductor = Arc::new(Conductor::new(backend, store, conductor_config)?);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(forward_shutdown(shutdown_signal(), stop_tx));

    let mut server = DaemonServer::new(config.socket_path.clone(), conductor);
    info!(socket_path = ?server.socket_path(), "Socket path");
    let result = server
        .run(async {
            let _ = stop_rx.await;
        })
        .await;

    match result {
        Ok(()) => {
            info!("Conductor daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_forwards_stop() {
        let (stop_tx, stop_rx) = oneshot::channel();
        forward_shutdown(async { Ok(()) }, stop_tx).await;
        assert!(stop_rx.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_signal_setup_keeps_serving() {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward_shutdown(
            async { Err(anyhow::anyhow!("no signal handler")) },
            stop_tx,
        ));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!forwarder.is_finished());
        assert!(matches!(
            stop_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        forwarder.abort();
    }
}
