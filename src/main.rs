//! promptguard binary entry point.
//!
//! One binary, two roles:
//!
//! - **Supervisor mode** (default): loads configuration, starts the
//!   interception engine as a child process, enables the OS proxy redirect,
//!   and runs the watchdog until interrupted.
//! - **Engine mode** (`internal-engine`, hidden): the interception engine
//!   itself, spawned by the supervisor with configuration in `PROMPTGUARD_*`
//!   environment variables.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::debug;

use promptguard::cli::{Cli, Commands};
use promptguard::config::{ConfigLoader, EngineConfig};
use promptguard::proxy::run_engine;
use promptguard::store::{HttpStore, MemoryStore};
use promptguard::supervisor::{Supervisor, SystemIntegration};

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;
    debug!("Parsed CLI arguments: {:?}", cli);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    match cli.command {
        Some(Commands::InternalEngine) => {
            let config = EngineConfig::from_env();
            debug!("Engine config from environment: {:?}", config);
            runtime
                .block_on(run_engine(config))
                .context("Interception engine failed")
        }
        None => {
            let loader = ConfigLoader::new();
            let mut config = loader
                .load(cli.config.as_deref())
                .context("Failed to load configuration")?;

            if let Some(port) = cli.port {
                config.supervisor.listen_port = port;
            }
            if let Some(workspace) = cli.workspace {
                config.supervisor.workspace = workspace;
            }

            let os = Arc::new(SystemIntegration);
            let sink: Arc<dyn promptguard::store::ActivitySink> =
                if config.supervisor.store_url.is_empty() {
                    Arc::new(MemoryStore::default())
                } else {
                    Arc::new(HttpStore::new(&config.supervisor.store_url))
                };

            let mut supervisor = Supervisor::new(&config, os.clone(), os, sink);
            runtime.block_on(supervisor.run())
        }
    }
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
