//! mcai-server - MusicChartsAI service
//!
//! Accepts audio uploads for fingerprint analysis, receives the
//! fingerprinting service's callbacks, and fetches chart, track, artist
//! and audience data on demand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcai_common::config::{RootFolderInitializer, RootFolderResolver, TomlConfig};
use mcai_common::events::EventBus;
use mcai_server::config::{resolve_credentials, Credentials, ServiceConfig};
use mcai_server::services::{
    AcrCloudClient, AcrCloudSettings, ChartDataSource, FingerprintService, SoundchartsClient,
    SoundchartsSettings, UnconfiguredChartSource, UnconfiguredFingerprint,
};

/// Time in-flight jobs get to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const EVENT_BUS_CAPACITY: usize = 256;

/// Command-line arguments for mcai-server
#[derive(Parser, Debug)]
#[command(name = "mcai-server")]
#[command(about = "MusicChartsAI analysis and chart service")]
#[command(version)]
struct Args {
    /// Root folder holding the database and uploads
    #[arg(short, long, env = "MCAI_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Path to mcai.toml
    #[arg(short, long, env = "MCAI_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, env = "MCAI_BIND")]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "MCAI_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config = TomlConfig::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    let default_filter = format!(
        "mcai_server={level},mcai_common={level},tower_http=info",
        level = toml_config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting mcai-server {} (git {}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    // Root folder and database
    let root_folder = RootFolderResolver::new("mcai-server")
        .with_cli_arg(args.root_folder.clone())
        .with_toml(&toml_config)
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db = mcai_common::db::init_database(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

    let mut config = ServiceConfig::from_toml(&toml_config, initializer.uploads_path());
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let credentials = resolve_credentials(&db, &toml_config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to resolve credentials: {}", e))?;
    let fingerprint = fingerprint_service(&config, &credentials);
    let chart_source = chart_data_source(&config, &credentials);

    let cancel = CancellationToken::new();
    let assembled = mcai_server::assemble(
        db,
        EventBus::new(EVENT_BUS_CAPACITY),
        fingerprint,
        chart_source,
        &config,
        credentials.webhook_token.clone(),
        cancel.clone(),
    );
    let state = assembled.state;
    let worker = tokio::spawn(assembled.worker.run(SHUTDOWN_GRACE));

    // Work interrupted by the previous process
    state
        .cascade
        .fail_interrupted()
        .await
        .context("Failed to close interrupted cascade runs")?;
    let requeued = state
        .pipeline
        .recover()
        .await
        .context("Failed to recover interrupted analyses")?;
    info!("Recovered {} interrupted analyses", requeued);
    state
        .pipeline
        .prune_stale_deliveries()
        .await
        .context("Failed to prune stale webhook deliveries")?;

    let app = mcai_server::build_router(state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("Server error")?;

    cancel.cancel();
    if let Err(e) = worker.await {
        warn!("Job worker ended abnormally: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

fn fingerprint_service(config: &ServiceConfig, credentials: &Credentials) -> Arc<dyn FingerprintService> {
    let (Some(token), Some(container)) = (
        credentials.acrcloud_bearer_token.clone(),
        credentials.acrcloud_container_id.clone(),
    ) else {
        warn!("ACRCloud credentials missing; uploads will fail until configured");
        return Arc::new(UnconfiguredFingerprint);
    };

    match AcrCloudClient::new(AcrCloudSettings {
        base_url: config.acrcloud_base_url.clone(),
        bearer_token: token,
        container_id: container,
    }) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("ACRCloud client unavailable: {}", e);
            Arc::new(UnconfiguredFingerprint)
        }
    }
}

fn chart_data_source(config: &ServiceConfig, credentials: &Credentials) -> Arc<dyn ChartDataSource> {
    let (Some(app_id), Some(api_key)) = (
        credentials.soundcharts_app_id.clone(),
        credentials.soundcharts_api_key.clone(),
    ) else {
        warn!("SoundCharts credentials missing; cascade fetches will fail until configured");
        return Arc::new(UnconfiguredChartSource);
    };

    match SoundchartsClient::new(SoundchartsSettings {
        base_url: config.soundcharts_base_url.clone(),
        app_id,
        api_key,
        requests_per_second: config.soundcharts_requests_per_second,
    }) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("SoundCharts client unavailable: {}", e);
            Arc::new(UnconfiguredChartSource)
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM, then cancels background work
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
    cancel.cancel();
}
