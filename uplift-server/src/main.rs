use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uplift_core::local::InMemoryPipeline;
use uplift_server::{
    config::AppConfig,
    routes,
    state::AppState,
};

const BUNDLED_SCRIPT: &[u8] = include_bytes!("../scripts/process.sh");

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "uplift-server")]
#[command(about = "Upload ingestion API and change-driven worker provisioning")]
struct Cli {
    /// Configuration file (TOML or JSON); same as UPLIFT_CONFIG_PATH
    #[arg(long, env = "UPLIFT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "UPLIFT_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "UPLIFT_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file_loaded = dotenvy::dotenv().is_ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,uplift::provision=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if env_file_loaded {
        info!("loaded .env file");
    }

    let (mut config, source) = AppConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    info!(?source, "configuration loaded");
    if config.pipeline.uploads.signing_key.is_empty() {
        warn!(
            "UPLIFT_SIGNING_KEY is not set; issued upload URLs will not survive a restart"
        );
    }

    let pipeline = InMemoryPipeline::new(config.pipeline.clone())
        .context("failed to assemble pipeline")?;
    let script = match &config.pipeline.provision.script_source {
        Some(path) => std::fs::read(path).with_context(|| {
            format!("failed to read processing script {}", path.display())
        })?,
        None => BUNDLED_SCRIPT.to_vec(),
    };
    pipeline
        .scripts
        .publish(script)
        .await
        .context("failed to publish processing script")?;
    for line in pipeline.authz.describe() {
        info!(target: "uplift::access", "{line}");
    }
    pipeline
        .runtime
        .start()
        .await
        .context("failed to start pipeline runtime")?;

    let app = routes::create_app(AppState::from_pipeline(&pipeline), &config.cors);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Starting Uplift server on {addr}");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
            shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    pipeline.runtime.shutdown().await?;
    info!("Uplift server stopped");
    Ok(())
}
