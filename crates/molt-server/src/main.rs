use anyhow::{Context, Result};
use clap::Parser;
use molt_handover::{
    ConfigInput, FileInput, GracefulShutdown, RestartError, RestartOptions, Restarter,
    ServerRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

mod config;
mod server;
mod telemetry;

use config::ServerConfig;
use server::HttpRegistry;
use telemetry::LogFormat;

/// HTTP server that restarts without dropping its listening sockets.
#[derive(Debug, Parser)]
#[command(name = "molt-server", version, about)]
struct Cli {
    /// Configuration file, re-read on every restart.
    #[arg(long, default_value = "molt.toml")]
    conf: PathBuf,

    /// Console log format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Seconds to wait for a new process to report ready
    /// (overrides MOLT_HANDSHAKE_TIMEOUT_SECS).
    #[arg(long)]
    handshake_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(cli.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("Molt Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let shutdown = GracefulShutdown::from_env();
    shutdown
        .listen_for_signals()
        .context("Failed to install signal handlers")?;
    let registry = Arc::new(HttpRegistry::new(Handle::current(), &shutdown));

    let input = if molt_handover::is_handoff_child() {
        info!("Started by a restarting parent, taking over its listeners");
        take_over(&cli, &registry)?
    } else {
        cold_start(&cli, &registry)?
    };

    let mut options = RestartOptions::from_env();
    if let Some(secs) = cli.handshake_timeout {
        options.handshake_timeout = Some(Duration::from_secs(secs));
    }
    let restarter = Arc::new(Restarter::new(input, options));
    info!(
        strategy = restarter.strategy_name(),
        "Serving; send SIGUSR1 to restart, SIGTERM to stop"
    );

    let signal = shutdown
        .run(|| restart(Arc::clone(&restarter), Arc::clone(&registry)))
        .await
        .context("Failed to listen for signals")?;

    info!(?signal, "Molt Server exited");
    Ok(())
}

/// Bind every configured listener from scratch.
fn cold_start(cli: &Cli, registry: &HttpRegistry) -> Result<Arc<dyn ConfigInput>> {
    let input: Arc<dyn ConfigInput> = Arc::new(
        FileInput::load(&cli.conf)
            .with_context(|| format!("Failed to read {}", cli.conf.display()))?,
    );
    registry
        .start_all(Arc::clone(&input))
        .map_err(|e| anyhow::anyhow!("Failed to start servers: {}", e))?;
    Ok(input)
}

/// Adopt the parent's listeners, serve the configuration it sent, then
/// tell it to stop.
#[cfg(unix)]
fn take_over(cli: &Cli, registry: &HttpRegistry) -> Result<Arc<dyn ConfigInput>> {
    let mut inherited = molt_handover::InheritedListeners::receive()
        .context("Failed to receive listeners from parent")?;

    let input: Arc<dyn ConfigInput> =
        Arc::new(FileInput::new(cli.conf.clone(), inherited.take_config()));
    let config = ServerConfig::from_input(&*input).context("Parent sent an invalid config")?;
    config.log_config();

    for listener in config.listeners {
        let address = listener.address.clone();
        let served = match inherited.take(&address) {
            Some(socket) => registry.serve(listener, socket),
            None => registry.bind(listener),
        };
        served.with_context(|| format!("Failed to serve {address}"))?;
    }

    // Dropping `inherited` on an early return closes descriptor 3 without
    // answering, which the parent reads as a failed restart.
    inherited.ready().context("Failed to signal readiness")?;
    Ok(input)
}

#[cfg(not(unix))]
fn take_over(cli: &Cli, registry: &HttpRegistry) -> Result<Arc<dyn ConfigInput>> {
    warn!("Listener inheritance is unsupported on this platform, binding fresh");
    cold_start(cli, registry)
}

/// Handle one restart request. Returns whether this process should now
/// drain and exit.
async fn restart(restarter: Arc<Restarter>, registry: Arc<HttpRegistry>) -> bool {
    let path = restarter.current_config().path().to_path_buf();
    let next = match FileInput::load(&path) {
        Ok(next) => next,
        Err(e) => {
            error!(
                config = %path.display(),
                error = %e,
                "Failed to read config; changes not applied"
            );
            return false;
        }
    };
    if let Err(e) = ServerConfig::parse(next.body()) {
        error!(config = %path.display(), error = %e, "Invalid config; changes not applied");
        return false;
    }

    let next: Arc<dyn ConfigInput> = Arc::new(next);
    let replaces_process = restarter.replaces_process();
    let outcome =
        tokio::task::spawn_blocking(move || restarter.restart(&*registry, Some(next))).await;

    match outcome {
        Ok(Ok(())) => {
            info!("Restart complete");
            replaces_process
        }
        Ok(Err(RestartError::Shutdown(e))) => {
            // The new process is serving; this one must not keep competing.
            warn!(error = %e, "New process is serving but old servers did not stop cleanly");
            true
        }
        Ok(Err(e)) => {
            error!(error = %e, still_serving = e.still_serving(), "Restart failed");
            // Nothing left to serve; exit so a supervisor can start over.
            !e.still_serving()
        }
        Err(e) => {
            error!(error = %e, "Restart task panicked");
            false
        }
    }
}
