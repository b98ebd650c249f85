#![forbid(unsafe_code)]

//! `kernel-gateway`: notebook kernel gateway server binary.
//!
//! Bootstraps configuration, the kernel session registry, the crash
//! monitor, and the HTTP API, then shuts every kernel down on SIGINT or
//! SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use kernel_gateway::api::handlers::AppState;
use kernel_gateway::api::server::serve_http;
use kernel_gateway::config::GlobalConfig;
use kernel_gateway::kernel::launcher::ProcessLauncher;
use kernel_gateway::orchestrator::child_monitor::spawn_child_monitor;
use kernel_gateway::orchestrator::registry::{RegistryConfig, SessionRegistry};
use kernel_gateway::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "kernel-gateway", about = "Notebook kernel gateway server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the interface the HTTP API binds to.
    #[arg(long)]
    host: Option<String>,

    /// Override the HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("kernel-gateway bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::from_toml_str("")?,
    };
    if let Some(host) = args.host {
        config.http_host = host;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }
    let config = Arc::new(config);
    info!(
        kernels = config.kernels.len(),
        default_kernel = %config.default_kernel,
        max_sessions = config.max_sessions,
        "configuration loaded"
    );

    // ── Build the session registry ──────────────────────
    let launcher = Arc::new(ProcessLauncher::from_config(&config));
    let registry = Arc::new(SessionRegistry::new(
        launcher,
        RegistryConfig::from_global(&config),
    ));

    let ct = CancellationToken::new();
    let monitor_handle =
        spawn_child_monitor(Arc::clone(&registry), config.monitor_interval(), ct.clone());
    info!("kernel crash monitor started");

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        registry: Arc::clone(&registry),
    });

    // ── Start the HTTP API ──────────────────────────────
    let http_ct = ct.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = serve_http(state, http_ct).await {
            error!(%err, "http transport failed");
        }
    });

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    registry.shutdown_all().await;

    let _ = tokio::join!(http_handle, monitor_handle);
    info!("kernel-gateway shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
