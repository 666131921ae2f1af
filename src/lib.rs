//! Sintra -- anomaly detection over distributed ping and traceroute measurements.
//!
//! This crate provides the detection core (baselines, per-kind detectors, the
//! pass orchestrator), batch execution over result documents, persistence,
//! reporting, and a small HTTP surface.

pub mod analysis;
pub mod api;
pub mod batch;
pub mod config;
pub mod detect;
pub mod measurement;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use crate::batch::BatchOutcome;
use crate::config::SintraConfig;
use crate::detect::Detector;
use crate::storage::events::{self, EventDocument};

/// Run one detection batch over every result document in the configured
/// results directory, then persist events, baselines, and the run record.
pub async fn run_detect(config: &SintraConfig) -> Result<BatchOutcome> {
    let detector = Arc::new(Detector::from_config(config)?);

    tracing::info!(db_path = %config.baseline.database_path.display(), "Loading baselines");
    let pool = storage::open_pool(&config.baseline.database_path)?;
    let stored = storage::load_baselines(&pool)?;
    tracing::debug!(count = stored.len(), "Restored baselines");
    detector.store().restore(stored);

    let inputs = events::discover_results(&config.paths.results_dir).await?;
    if inputs.is_empty() {
        tracing::warn!(dir = %config.paths.results_dir.display(), "No measurement result documents found");
    }

    let outcome = batch::run_batch(detector.clone(), inputs, config.batch.workers).await;

    for report in &outcome.reports {
        let doc = EventDocument {
            measurement_id: report.measurement_id,
            run_id: outcome.run_id.clone(),
            generated_at: outcome.finished_at,
            events: report.events.clone(),
        };
        let path = events::write_event_document(&config.paths.events_dir, &doc).await?;
        tracing::debug!(path = %path.display(), events = doc.events.len(), "Wrote event document");
    }

    storage::save_baselines(&pool, &detector.store().snapshot())?;
    storage::record_run(
        &pool,
        &storage::RunRecord {
            run_id: outcome.run_id.clone(),
            documents: outcome.reports.len() + outcome.skipped.len(),
            skipped: outcome.skipped.len(),
            sample_warnings: outcome.sample_warning_count(),
            anomalies: outcome.anomaly_count(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
        },
    )?;

    Ok(outcome)
}

/// Start the HTTP server over the configured events and results directories.
pub async fn serve(config: &SintraConfig, bind: &str) -> Result<()> {
    let pool = storage::open_pool(&config.baseline.database_path)?;
    let state = api::state::AppState {
        pool,
        results_dir: config.paths.results_dir.clone(),
        events_dir: config.paths.events_dir.clone(),
    };

    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(state);

    tracing::info!(%addr, "Sintra listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
