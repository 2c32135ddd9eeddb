#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use shared_worker::host::INITIAL_DATA_ENV;
use shared_worker::transport::Channel;
use shared_worker::{run_plugin_worker, Config, PluginCatalog, PluginLaunch};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

/// Shared-worker message bus for test runners.
#[derive(Parser, Debug)]
#[command(name = "shared-worker")]
#[command(version)]
#[command(about = "Run and inspect shared worker plugins.", long_about = None)]
struct Cli {
    /// Config file (default: built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a built-in plugin as a shared worker speaking envelopes on stdin/stdout
    #[command(long_about = "\
Run a built-in plugin as a shared worker.

Envelopes are read from stdin and written to stdout, one JSON document per \
line. Logs go to stderr. The process exits non-zero when the plugin crashes.

Examples:
  shared-worker plugin echo
  shared-worker plugin echo --initial-data '{\"seed\": 7}'")]
    Plugin {
        /// Plugin filename in the built-in catalog
        filename: String,

        /// Initial data handed to the plugin factory (JSON). Falls back to
        /// SHARED_WORKER_INITIAL_DATA.
        #[arg(long)]
        initial_data: Option<String>,
    },

    /// Print the JSON schema of the config file
    ConfigSchema,

    /// Load and validate a config file
    CheckConfig {
        /// Path to the config file
        path: PathBuf,
    },
}

async fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn parse_initial_data(raw: Option<String>) -> Result<Value> {
    let raw = raw.or_else(|| std::env::var(INITIAL_DATA_ENV).ok());
    match raw.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => serde_json::from_str(raw).context("Initial data must be valid JSON"),
        None => Ok(Value::Null),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build the tokio runtime")?;
    let outcome = runtime.block_on(run(cli));
    // Plugin mode reads stdin on a blocking thread that never returns while
    // the host keeps the pipe open; exit without waiting for it.
    runtime.shutdown_background();
    outcome
}

async fn run(cli: Cli) -> Result<()> {
    // Schema output must stay stdout-only.
    if let Commands::ConfigSchema = &cli.command {
        println!("{}", Config::schema_json()?);
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO.
    // stdout carries envelopes in plugin mode, so logs go to stderr.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match cli.command {
        Commands::Plugin {
            filename,
            initial_data,
        } => {
            let config = load_config(cli.config.as_deref()).await?;
            let initial_data = parse_initial_data(initial_data)?;
            let factory = PluginCatalog::with_builtins().get(&filename)?;
            let launch = PluginLaunch::new(filename)
                .with_initial_data(initial_data)
                .with_protocol(config.protocol.version);
            let link = Channel::from_io(tokio::io::stdin(), tokio::io::stdout());
            run_plugin_worker(factory, launch, link)
                .await
                .context("Shared worker crashed")?;
            Ok(())
        }
        Commands::CheckConfig { path } => {
            let config = load_config(Some(&path)).await?;
            println!("Config OK: {}", path.display());
            println!("  protocol: {}", config.protocol.version);
            println!("  trace: {}", config.trace.mode);
            let mut plugins: Vec<_> = config.plugins.keys().collect();
            plugins.sort_unstable();
            for filename in plugins {
                println!("  plugin: {filename}");
            }
            Ok(())
        }
        Commands::ConfigSchema => Ok(()),
    }
}
