//! DICL Service Binary
//!
//! `dicl-service` serves the REST API; `dicl-service populate` runs the
//! configured population jobs once and exits.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dicl_common::VERSION;
use dicl_service::{api, DiclConfig, DiclService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting DICL service v{}", VERSION);

    let config = DiclConfig::load()?;
    info!(
        functions = config.functions.len(),
        embedding_models = config.embedding_models.len(),
        models = config.models.len(),
        store = ?config.store.kind,
        history = ?config.history.kind,
        "Loaded configuration"
    );

    let command = std::env::args().nth(1);
    let service = DiclService::from_config(config).await?;

    match command.as_deref() {
        None | Some("serve") => serve(Arc::new(service)).await,
        Some("populate") => populate(&service).await,
        Some(other) => bail!("unknown command `{other}` (expected `serve` or `populate`)"),
    }
}

async fn serve(service: Arc<DiclService>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", service.config().host, service.config().port).parse()?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    let app = api::router(service);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("REST API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Shutting down DICL service");
    Ok(())
}

async fn populate(service: &DiclService) -> Result<()> {
    if service.config().population.is_empty() {
        info!("No population jobs configured");
        return Ok(());
    }

    for report in service.populate_all().await? {
        info!(
            partition = ?report.partition.as_ref().map(ToString::to_string),
            inserted = report.inserted,
            metric_candidates = report.metric_candidates,
            demonstration_candidates = report.demonstration_candidates,
            duplicates_skipped = report.duplicates_skipped,
            embedding_failures = report.embedding_failures,
            "Population job finished"
        );
    }
    Ok(())
}
