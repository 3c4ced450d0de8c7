use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cinder_core::engine::{EngineBackend, SimulatedEngine};
use cinder_core::metrics::{BridgeMetrics, LoggingMetricsBackend};
use cinder_core::{CinderConfig, Dispatcher};
use cinder_engine::HttpBackend;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rmcp::ServiceExt;
use tracing_subscriber::{EnvFilter, fmt};

mod server;

use server::CinderServer;

#[derive(Parser)]
#[command(
    name = "cinder",
    about = "Cinder: agent tool bridge for a node-graph scene engine",
    version
)]
struct Cli {
    /// Log line format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the tool catalogue over MCP on stdio (the default)
    Serve(ServeArgs),
    /// Print every tool contract as JSON
    Tools,
    /// Run the simulated engine behind its HTTP control API
    SimEngine {
        #[arg(long, default_value = "127.0.0.1:8765")]
        bind: SocketAddr,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Path to cinder.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Engine control API base URL (overrides config and CINDER_ENGINE_URL)
    #[arg(long)]
    engine_url: Option<String>,

    /// Drive the in-process simulated engine instead of a live one
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they don't interfere with MCP stdio transport on stdout
    let subscriber = fmt()
        .with_env_filter(EnvFilter::from_env("CINDER_LOG"))
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => serve(args).await,
        Commands::Tools => print_tools(),
        Commands::SimEngine { bind } => {
            cinder_engine::stand_in::serve(bind, Arc::new(SimulatedEngine::new()))
                .await
                .with_context(|| format!("stand-in engine failed on {bind}"))
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = CinderConfig::discover(args.config.as_deref())
        .context("failed to load config")?
        .with_env_overrides();
    if let Some(url) = args.engine_url {
        config.engine.base_url = url;
    }
    config.validate().context("invalid config")?;

    let backend: Arc<dyn EngineBackend> = if args.simulate {
        Arc::new(SimulatedEngine::new())
    } else {
        Arc::new(HttpBackend::from_config(&config.engine).context("failed to build engine client")?)
    };

    tracing::info!(
        backend = backend.name(),
        engine_url = %config.engine.base_url,
        "Starting Cinder MCP server"
    );

    let metrics = Arc::new(BridgeMetrics::with_backend(Arc::new(LoggingMetricsBackend)));
    let dispatcher = Dispatcher::new(&config, backend)
        .context("failed to build dispatcher")?
        .with_metrics(metrics.clone());

    let server = CinderServer::new(Arc::new(dispatcher))
        .serve(rmcp::transport::io::stdio())
        .await?;

    tracing::info!("Cinder serving on stdio");

    // Run until the agent disconnects
    server.waiting().await?;

    let stats = metrics.snapshot();
    tracing::info!(
        calls = stats.calls,
        failures = stats.failures,
        batches_aborted = stats.batches_aborted,
        "Cinder shutting down"
    );
    Ok(())
}

fn print_tools() -> Result<()> {
    let tools: Vec<_> = cinder_core::Catalogue::builtin()
        .iter()
        .map(|contract| contract.to_json())
        .collect();
    println!("{}", serde_json::to_string_pretty(&tools)?);
    Ok(())
}
