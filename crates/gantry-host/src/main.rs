//! gantry-host, the runtime-side command server.
//!
//! This binary runs inside the external runtime process. It connects
//! back to the engine over the Unix socket named by `--connect`,
//! advertises the remote-harness capability in its help output, and
//! serves framed commands against the registered suites until shutdown.
//!
//! The stock binary serves an empty registry; embedding applications
//! link `gantry_host::serve_connection` and register their own suites.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gantry_core::{CommandDispatcher, ExecutionConfig, InMemorySuiteRegistry};
use gantry_host::serve_connection;
use tokio::net::UnixStream;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// gantry host runtime: serves test commands over the engine channel.
#[derive(Parser, Debug)]
#[command(name = "gantry-host")]
#[command(version, about, long_about = None)]
struct Args {
    /// Serve the engine over the remote harness channel. This is the
    /// capability flag the engine's probe looks for in `--help` output.
    #[arg(long)]
    remote_harness: bool,

    /// Unix socket path of the engine channel to connect back to.
    #[arg(long)]
    connect: PathBuf,

    /// Workspace directory the runtime operates in.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Path to an execution configuration TOML file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Extra pass-through parameters, ignored by the stock host.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    extra: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::env::set_current_dir(&args.workspace).context("failed to enter workspace directory")?;

    let config = match &args.config {
        Some(path) => ExecutionConfig::from_file(path).context("failed to load configuration")?,
        None => ExecutionConfig::default(),
    };

    if !args.extra.is_empty() {
        info!(extra = ?args.extra, "ignoring pass-through parameters");
    }

    let registry = Arc::new(InMemorySuiteRegistry::new());
    let dispatcher = Arc::new(CommandDispatcher::new(registry, config));

    info!(
        socket = %args.connect.display(),
        remote_harness = args.remote_harness,
        "connecting to engine channel"
    );
    let stream = UnixStream::connect(&args.connect)
        .await
        .context("failed to connect to engine channel")?;

    serve_connection(stream, dispatcher)
        .await
        .context("serve loop failed")?;

    info!("host exiting cleanly");
    Ok(())
}
