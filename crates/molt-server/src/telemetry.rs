//! Logging setup for Molt Server.
//!
//! Both the parent and a handover child write to the same stdout/stderr
//! (the child inherits them at descriptors 1 and 2); the startup line
//! records which process is which.

use clap::ValueEnum;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,molt_server=debug,molt_handover=debug";

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, multi-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Initialize tracing with an `EnvFilter` (`RUST_LOG`, default
/// `info,molt_server=debug,molt_handover=debug`) and a console layer.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .pretty();
            registry.with(fmt_layer).try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(false);
            registry.with(fmt_layer).try_init()?;
        }
    }

    tracing::info!(
        pid = std::process::id(),
        format = ?format,
        "Telemetry initialized"
    );

    Ok(())
}
