//! CLI entry point for the cellrun execution runtime.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use cellrun_server::{AppFactory, Config};

#[derive(Parser)]
#[command(name = "cellrun")]
#[command(about = "Remote code execution runtime for notebook front-ends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the execution runtime's HTTP server
    Serve {
        /// Host address to bind to, overriding CELLRUN_HOST
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on, overriding CELLRUN_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Serve { host, port } => serve(host, port).await,
    }
}

async fn serve(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = AppFactory::build(config);
    let app = cellrun_server::build_router(state.clone());

    tracing::info!("starting cellrun server at http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await?;

    AppFactory::shutdown(&state);
    tracing::info!("cellrun server shutdown complete");

    Ok(())
}
