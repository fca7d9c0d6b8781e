use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod cli;
mod config;
mod handler;
mod state;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = cli::Cli::parse();
    let mut gateway_config = config::load(&cli.config)?;
    if let Some(host) = cli.host {
        gateway_config.server.host = host;
    }
    if let Some(port) = cli.port {
        gateway_config.server.port = port;
    }
    let bind = format!(
        "{}:{}",
        gateway_config.server.host, gateway_config.server.port
    );

    let state = Arc::new(state::AppState::from_config(gateway_config).await);
    let app = handler::router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "listening", bind = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
