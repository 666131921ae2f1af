//! Documents on disk: measurement results in, one JSON file of anomaly events
//! per measurement out.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::detect::AnomalyEvent;
use crate::measurement::{parse_document, MeasurementResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDocument {
    pub measurement_id: u64,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub events: Vec<AnomalyEvent>,
}

pub fn event_file_name(measurement_id: u64) -> String {
    format!("measurement_{}_events.json", measurement_id)
}

/// Write `doc` into `dir`, replacing any earlier document for the same
/// measurement. The file is written beside its final name and then renamed.
pub async fn write_event_document(dir: &Path, doc: &EventDocument) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating events directory {}", dir.display()))?;

    let path = dir.join(event_file_name(doc.measurement_id));
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(doc)?;

    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("renaming {} into place", tmp.display()))?;

    Ok(path)
}

/// Read every event document in `dir`, ordered by measurement id.
/// Unreadable files are logged and skipped; a missing directory yields nothing.
pub async fn read_event_documents(dir: &Path) -> Result<Vec<EventDocument>> {
    let mut docs = Vec::new();
    for path in list_matching(dir, is_event_file).await? {
        let parsed = tokio::fs::read(&path)
            .await
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice::<EventDocument>(&bytes).map_err(Into::into));
        match parsed {
            Ok(doc) => docs.push(doc),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable event document"),
        }
    }
    docs.sort_by_key(|d| d.measurement_id);
    Ok(docs)
}

/// Measurement result files in `dir`, sorted by name.
pub async fn discover_results(dir: &Path) -> Result<Vec<PathBuf>> {
    list_matching(dir, is_result_file).await
}

/// Parse every measurement result file in `dir`. Files that cannot be read
/// or parsed are logged and skipped.
pub async fn read_results(dir: &Path) -> Result<Vec<MeasurementResult>> {
    let mut results = Vec::new();
    for path in discover_results(dir).await? {
        let parsed = tokio::fs::read_to_string(&path)
            .await
            .map_err(anyhow::Error::from)
            .and_then(|text| parse_document(&text).map_err(Into::into));
        match parsed {
            Ok(result) => results.push(result),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable measurement result"),
        }
    }
    Ok(results)
}

fn is_result_file(name: &str) -> bool {
    name.starts_with("measurement_") && name.contains("_result") && name.ends_with(".json")
}

fn is_event_file(name: &str) -> bool {
    name.starts_with("measurement_") && name.ends_with("_events.json")
}

async fn list_matching(dir: &Path, matches: fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading directory {}", dir.display()))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name_matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(matches)
            .unwrap_or(false);
        if name_matches && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
