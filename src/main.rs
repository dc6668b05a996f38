use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use callback_dispatcher::{server, ServiceConfig, Supervisor, TaskStore};

#[derive(Parser)]
#[command(name = "callback-dispatcher", version, about = "Durable HTTP callback scheduler")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service (default).
    Serve,
    /// Print persisted callbacks due in a time range as JSON lines.
    Export {
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => ServiceConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ServiceConfig::default(),
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Export { from, to } => export(config, from, to).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn serve(config: ServiceConfig) -> Result<()> {
    let supervisor = Arc::new(Supervisor::from_config(&config)?);
    supervisor.start().await.context("failed to start callback service")?;

    let shutdown = CancellationToken::new();
    let app = server::router(Arc::clone(&supervisor), config.unauthorized_delay);

    let mut listeners = Vec::with_capacity(config.listeners.len());
    for addr in &config.listeners {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        listeners.push(tokio::spawn(server::serve(listener, app.clone(), shutdown.child_token())));
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    shutdown.cancel();

    for handle in listeners {
        match handle.await {
            Ok(Err(err)) => error!(error = %err, "listener failed"),
            Err(err) => error!(error = %err, "listener task panicked"),
            Ok(Ok(())) => {}
        }
    }

    supervisor.stop().await?;
    Ok(())
}

async fn export(config: ServiceConfig, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<()> {
    let store = config.build_store()?;
    store.open().await?;

    let tasks = store.list_tasks_due_between(from, to).await?;
    for task in &tasks {
        println!("{}", serde_json::to_string(task)?);
    }

    store.close().await?;
    info!(count = tasks.len(), "export complete");
    Ok(())
}
