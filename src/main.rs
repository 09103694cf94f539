use anyhow::{bail, Context, Result};
use futures::future::join_all;
use std::fs;
use std::sync::Arc;
use tracing::{error, info};

use document_registrar::config;
use document_registrar::metrics::{run_metrics_server, Metrics};
use document_registrar::{AdmissionController, Document, DocumentRegistrar, HttpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("document_registrar=info".parse()?)
        )
        .init();

    info!("Starting document registrar");

    let config = config::load_config()?;
    let limit = config.limiter.rate_limit()?;

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        bail!("Usage: document-registrar <document.json>...");
    }
    let documents = paths
        .iter()
        .map(|path| load_document(path))
        .collect::<Result<Vec<_>>>()?;

    let limiter = Arc::new(AdmissionController::new(limit));
    let metrics = Arc::new(Metrics::new());
    let transport = HttpTransport::new(
        config.transport.endpoint_url.clone(),
        config.transport.timeout_ms,
    )?;
    info!(
        "Budget: {} calls per {:?}, endpoint {}",
        limit.capacity(),
        limit.window(),
        transport.endpoint_url()
    );

    tokio::spawn(run_metrics_server(
        config.metrics.clone(),
        metrics.clone(),
        limiter.clone(),
    ));

    let registrar = DocumentRegistrar::new(limiter, transport, metrics)
        .with_default_deadline(config.limiter.acquire_timeout());

    let results = join_all(documents.iter().map(|doc| registrar.submit(doc))).await;

    let mut failures = 0;
    for (path, result) in paths.iter().zip(results) {
        match result {
            Ok(body) => info!("{}: {}", path, body),
            Err(e) => {
                failures += 1;
                error!("{}: {}", path, e);
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} submissions failed", failures, paths.len());
    }
    Ok(())
}

fn load_document(path: &str) -> Result<Document> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read document: {}", path))?;
    Document::from_json(&content).with_context(|| format!("Invalid document: {}", path))
}
