use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use strand_domain::config::ConfigSeverity;
use strand_engine::workpool::BoundedWorkPool;
use strand_engine::{EngineBuilder, UnconfiguredProvider};
use strand_gateway::config::GatewayConfig;
use strand_gateway::{api, AppState};

#[derive(Parser)]
#[command(name = "strand", about = "Durable agent orchestrator gateway")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "strand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway (the default).
    Serve,
    /// Validate the configuration and exit.
    CheckConfig,
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli.config)?;

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing(&config);
            run_server(config).await
        }
        Some(Command::CheckConfig) => {
            let issues = config.validate();
            for issue in &issues {
                println!("{:?}: {issue}", issue.severity);
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Version) => {
            println!("strand {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing(config: &GatewayConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.server.log_filter.clone())),
        )
        .json()
        .init();
}

async fn run_server(config: GatewayConfig) -> anyhow::Result<()> {
    tracing::info!("strand starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Engine ───────────────────────────────────────────────────────
    // The standalone gateway has no model wired up: turns fail with
    // "no model provider configured" until an embedding application
    // builds the engine with a real provider and its tool registry.
    let mut builder =
        EngineBuilder::new(Arc::new(UnconfiguredProvider)).config(config.engine.clone());
    if config.workpool.max_concurrent_streams > 0 {
        builder = builder.workpool(Arc::new(BoundedWorkPool::new(
            config.workpool.max_concurrent_streams,
        )));
    }
    if config.workpool.max_concurrent_tools > 0 {
        builder = builder.tool_workpool(Arc::new(BoundedWorkPool::new(
            config.workpool.max_concurrent_tools,
        )));
    }
    let engine = builder.build();
    engine.start();
    tracing::info!("engine started");

    // ── HTTP surface ─────────────────────────────────────────────────
    let router = api::router(AppState { engine })
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr: std::net::SocketAddr = config.server.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}
