//! Batch detection over a set of measurement result files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::detect::{DetectionReport, Detector};
use crate::measurement::{parse_document, MeasurementResult};

/// An input document that could not be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One report per evaluated document, ordered by measurement id.
    pub reports: Vec<DetectionReport>,
    pub skipped: Vec<SkippedDocument>,
}

impl BatchOutcome {
    pub fn anomaly_count(&self) -> usize {
        self.reports.iter().map(|r| r.anomaly_count()).sum()
    }

    pub fn sample_warning_count(&self) -> usize {
        self.reports.iter().map(|r| r.warnings.len()).sum()
    }
}

/// Run detection over `inputs` with at most `workers` tasks in flight.
///
/// Documents are read and parsed concurrently, then grouped by target.
/// Groups run in parallel; within a group measurements are evaluated one
/// at a time in ascending id so shared baselines evolve the same way on
/// every run. Per-document failures are collected as [`SkippedDocument`]s
/// and never abort the batch.
pub async fn run_batch(detector: Arc<Detector>, inputs: Vec<PathBuf>, workers: usize) -> BatchOutcome {
    let run_id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();
    let permits = Arc::new(Semaphore::new(workers.max(1)));

    info!(%run_id, documents = inputs.len(), workers, "Starting detection batch");

    let (groups, mut skipped) = load_documents(inputs, &permits).await;

    let mut set = JoinSet::new();
    for (target, group) in groups {
        let detector = detector.clone();
        let permits = permits.clone();
        set.spawn(async move {
            // Never closed; a permit is always granted eventually.
            let _permit = permits.acquire_owned().await.ok();
            debug!(%target, documents = group.len(), "Evaluating target group");
            tokio::task::spawn_blocking(move || {
                group
                    .iter()
                    .map(|(_, measurement)| detector.detect(measurement))
                    .collect::<Vec<_>>()
            })
            .await
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(group_reports)) => reports.extend(group_reports),
            Ok(Err(e)) | Err(e) => {
                warn!(error = %e, "Detection task failed");
                skipped.push(SkippedDocument {
                    path: PathBuf::new(),
                    reason: e.to_string(),
                });
            }
        }
    }

    reports.sort_by_key(|r| r.measurement_id);
    skipped.sort_by(|a, b| a.path.cmp(&b.path));

    let outcome = BatchOutcome {
        run_id,
        started_at,
        finished_at: Utc::now(),
        reports,
        skipped,
    };
    info!(
        run_id = %outcome.run_id,
        evaluated = outcome.reports.len(),
        skipped = outcome.skipped.len(),
        anomalies = outcome.anomaly_count(),
        "Detection batch complete"
    );
    outcome
}

type TargetGroups = BTreeMap<String, Vec<(PathBuf, MeasurementResult)>>;

/// Read and parse every input, grouping the parsed measurements by target
/// in ascending measurement id (path breaks ties).
async fn load_documents(inputs: Vec<PathBuf>, permits: &Arc<Semaphore>) -> (TargetGroups, Vec<SkippedDocument>) {
    let mut set = JoinSet::new();
    for path in inputs {
        let permits = permits.clone();
        set.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            let result = load(&path).await;
            (path, result)
        });
    }

    let mut groups = TargetGroups::new();
    let mut skipped = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((path, Ok(measurement))) => groups
                .entry(measurement.target.clone())
                .or_default()
                .push((path, measurement)),
            Ok((path, Err(e))) => {
                warn!(path = %path.display(), error = %e, "Skipping measurement document");
                skipped.push(SkippedDocument {
                    path,
                    reason: format!("{:#}", e),
                });
            }
            Err(e) => {
                warn!(error = %e, "Loading task failed");
                skipped.push(SkippedDocument {
                    path: PathBuf::new(),
                    reason: e.to_string(),
                });
            }
        }
    }

    for group in groups.values_mut() {
        group.sort_by(|(pa, a), (pb, b)| a.id.cmp(&b.id).then_with(|| pa.cmp(pb)));
    }
    (groups, skipped)
}

async fn load(path: &Path) -> Result<MeasurementResult> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_document(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SintraConfig;

    #[tokio::test]
    async fn test_empty_batch() {
        let detector = Arc::new(Detector::from_config(&SintraConfig::default()).unwrap());
        let outcome = run_batch(detector, Vec::new(), 4).await;
        assert!(outcome.reports.is_empty());
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.anomaly_count(), 0);
        assert!(!outcome.run_id.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let detector = Arc::new(Detector::from_config(&SintraConfig::default()).unwrap());
        let outcome = run_batch(detector, vec![PathBuf::from("/nonexistent/measurement_1_result.json")], 0).await;
        assert_eq!(outcome.skipped.len(), 1);
        assert!(outcome.skipped[0].reason.contains("reading"));
    }

    #[tokio::test]
    async fn test_groups_sorted_by_measurement_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = Vec::new();
        for (id, target) in [(30, "b.example"), (10, "a.example"), (20, "a.example")] {
            let path = dir.path().join(format!("measurement_{}_result.json", id));
            std::fs::write(
                &path,
                format!(r#"{{"measurement_id": {}, "type": "ping", "target": "{}", "results": []}}"#, id, target),
            )
            .unwrap();
            inputs.push(path);
        }

        let permits = Arc::new(Semaphore::new(2));
        let (groups, skipped) = load_documents(inputs, &permits).await;
        assert!(skipped.is_empty());
        let a: Vec<u64> = groups["a.example"].iter().map(|(_, m)| m.id).collect();
        assert_eq!(a, vec![10, 20]);
        assert_eq!(groups["b.example"].len(), 1);
    }
}
