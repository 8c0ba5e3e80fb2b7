use anyhow::{Context, Result};
use checkin_service::annotate::PredictionClient;
use checkin_service::config::{Config, StoreBackend};
use checkin_service::stores::{
    self, BlobStore, ClickHouseWideColumnStore, CredentialStore, EsCredentialStore, EsPostIndex,
    MemoryBlobStore, MemoryCredentialStore, MemoryPostIndex, MemoryWideColumnStore, PostIndex,
    S3BlobStore, WideColumnStore,
};
use checkin_service::{start_api_server, AppState, AuthService, GeoQueryEngine, IngestPipeline, SystemClock};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct Backends {
    credentials: Arc<dyn CredentialStore>,
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn PostIndex>,
    columns: Arc<dyn WideColumnStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        backend = ?config.stores.backend,
        "Starting Around check-in service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let backends = match config.stores.backend {
        StoreBackend::Remote => connect_remote(&config).await?,
        StoreBackend::Memory => {
            warn!("Using in-memory stores, nothing survives a restart");
            in_memory(&config)
        }
    };

    let timeout = config.store_timeout();

    let auth = AuthService::new(
        &config.auth,
        backends.credentials,
        Arc::new(SystemClock),
        timeout,
    )
    .context("Failed to initialize auth service")?;

    let mut ingest = IngestPipeline::new(
        backends.blobs,
        backends.index.clone(),
        backends.columns,
        timeout,
    );
    if let Some(annotator) = PredictionClient::from_config(&config.annotator, timeout)
        .context("Failed to initialize image annotator")?
    {
        info!("Image annotation enabled");
        ingest = ingest.with_annotator(Arc::new(annotator));
    }

    let state = AppState {
        auth: Arc::new(auth),
        ingest: Arc::new(ingest),
        query: Arc::new(GeoQueryEngine::new(backends.index, timeout)),
    };

    info!("Check-in service started successfully");

    start_api_server(state, &config.api, shutdown_signal()).await?;

    info!("Check-in service stopped");

    Ok(())
}

/// Reach every managed store and make sure indexes and tables exist
async fn connect_remote(config: &Config) -> Result<Backends> {
    let timeout = config.store_timeout();

    let es = stores::elasticsearch::connect(&config.elasticsearch.url, timeout)
        .context("Failed to create Elasticsearch client")?;

    let index = EsPostIndex::new(es.clone(), &config.elasticsearch);
    index
        .ensure_index()
        .await
        .context("Failed to prepare post index")?;

    let credentials = EsCredentialStore::new(es, &config.elasticsearch);
    credentials
        .ensure_index()
        .await
        .context("Failed to prepare credential index")?;

    let blobs = S3BlobStore::new(&config.s3)
        .await
        .context("Failed to initialize S3 blob store")?;

    let columns = ClickHouseWideColumnStore::new(&config.clickhouse);
    columns
        .ensure_schema()
        .await
        .context("Failed to prepare ClickHouse table")?;

    Ok(Backends {
        credentials: Arc::new(credentials),
        blobs: Arc::new(blobs),
        index: Arc::new(index),
        columns: Arc::new(columns),
    })
}

fn in_memory(config: &Config) -> Backends {
    Backends {
        credentials: Arc::new(MemoryCredentialStore::new()),
        blobs: Arc::new(MemoryBlobStore::new(config.s3.bucket.clone())),
        index: Arc::new(MemoryPostIndex::new()),
        columns: Arc::new(MemoryWideColumnStore::new()),
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down check-in service");
}
