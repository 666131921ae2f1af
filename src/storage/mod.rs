//! SQLite storage for baselines and run history, plus event documents on disk.

pub mod events;
pub mod schema;

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::detect::{Baseline, BaselineKey};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Replace the persisted baselines with `entries` in one transaction.
pub fn save_baselines(pool: &Pool, entries: &[(BaselineKey, Baseline)]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM baselines", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO baselines
                (target, probe_id, avg_latency, latency_samples, route_json, route_changes_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;

        for (key, baseline) in entries {
            let route_json = baseline
                .route
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let changes_json = serde_json::to_string(&baseline.route_changes)?;
            stmt.execute(params![
                key.target,
                key.probe_id as i64,
                baseline.avg_latency,
                baseline.latency_samples as i64,
                route_json,
                changes_json,
                baseline.updated_at.map(|t| t.to_rfc3339()),
            ])?;
        }
    }

    tx.commit()?;
    tracing::debug!(count = entries.len(), "Saved baselines");
    Ok(entries.len())
}

/// Load all persisted baselines, ordered by key.
pub fn load_baselines(pool: &Pool) -> Result<Vec<(BaselineKey, Baseline)>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT target, probe_id, avg_latency, latency_samples, route_json, route_changes_json, updated_at
         FROM baselines ORDER BY target, probe_id",
    )?;

    type Row = (String, i64, Option<f64>, i64, Option<String>, String, Option<String>);
    let rows: Vec<Row> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?
        .collect::<Result<_, _>>()?;

    let mut entries = Vec::with_capacity(rows.len());
    for (target, probe_id, avg_latency, samples, route_json, changes_json, updated_at) in rows {
        let route: Option<Vec<String>> = route_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("decoding route for {} probe {}", target, probe_id))?;
        let route_changes: VecDeque<DateTime<Utc>> = serde_json::from_str(&changes_json)
            .with_context(|| format!("decoding route changes for {} probe {}", target, probe_id))?;
        let updated_at = updated_at
            .as_deref()
            .map(DateTime::parse_from_rfc3339)
            .transpose()?
            .map(|t| t.with_timezone(&Utc));

        entries.push((
            BaselineKey::new(target, probe_id as u64),
            Baseline {
                avg_latency,
                latency_samples: samples as u64,
                route,
                route_changes,
                updated_at,
            },
        ));
    }

    Ok(entries)
}

/// Bookkeeping for one batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub documents: usize,
    pub skipped: usize,
    pub sample_warnings: usize,
    pub anomalies: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn record_run(pool: &Pool, run: &RunRecord) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO detection_runs
            (run_id, documents, skipped, sample_warnings, anomalies, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.run_id,
            run.documents as i64,
            run.skipped as i64,
            run.sample_warnings as i64,
            run.anomalies as i64,
            run.started_at.to_rfc3339(),
            run.finished_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Most recent runs, newest first.
pub fn recent_runs(pool: &Pool, limit: usize) -> Result<Vec<RunRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT run_id, documents, skipped, sample_warnings, anomalies, started_at, finished_at
         FROM detection_runs ORDER BY started_at DESC, id DESC LIMIT ?1",
    )?;

    let rows: Vec<(String, i64, i64, i64, i64, String, String)> = stmt
        .query_map(params![limit as i64], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?
        .collect::<Result<_, _>>()?;

    rows.into_iter()
        .map(|(run_id, documents, skipped, warnings, anomalies, started, finished)| {
            Ok(RunRecord {
                run_id,
                documents: documents as usize,
                skipped: skipped as usize,
                sample_warnings: warnings as usize,
                anomalies: anomalies as usize,
                started_at: DateTime::parse_from_rfc3339(&started)?.with_timezone(&Utc),
                finished_at: DateTime::parse_from_rfc3339(&finished)?.with_timezone(&Utc),
            })
        })
        .collect()
}
