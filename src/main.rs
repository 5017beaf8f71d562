mod catalog;
mod config;
mod engine;
mod error;
mod exchange;
mod ingest;
mod model;
mod price;
mod provider;
mod retry;
mod server;
mod volume;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Config, ProviderImpl};
use engine::Engine;
use provider::fixed::FixedProvider;
use provider::random::RandomProvider;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("startup error")]
    Startup,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(
    name = "feed-value-provider",
    about = "Aggregated price and volume feeds for protocol data providers"
)]
struct Cli {
    /// Directory holding feeds.json / test-feeds.json
    #[arg(short, long, default_value = "config")]
    config_dir: String,
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = Arc::new(
        Config::from_env(PathBuf::from(cli.config_dir)).change_context(AppError::Config)?,
    );

    init_tracing(&config);

    let mut engine = None;
    let provider: server::SharedProvider = match config.provider_impl {
        ProviderImpl::Fixed => Arc::new(FixedProvider::new()),
        ProviderImpl::Random => Arc::new(RandomProvider),
        ProviderImpl::Live => {
            let live = Engine::new(Arc::clone(&config));
            live.start().await.change_context(AppError::Startup)?;
            engine = Some(live.clone());
            Arc::new(live)
        }
    };

    let app = server::router(provider);
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .change_context(AppError::Runtime)
        .attach_with(|| format!("port: {}", config.port))?;

    info!(
        port = config.port,
        provider = %config.provider_impl,
        network = %config.network,
        "value provider listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .change_context(AppError::Runtime)?;

    if let Some(engine) = engine {
        engine.stop().await;
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("ctrl+c received, shutting down");
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
