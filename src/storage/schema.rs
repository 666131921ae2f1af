//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS baselines (
            target TEXT NOT NULL,
            probe_id INTEGER NOT NULL,
            avg_latency REAL,
            latency_samples INTEGER NOT NULL DEFAULT 0,
            route_json TEXT,
            route_changes_json TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT,
            PRIMARY KEY (target, probe_id)
        );

        CREATE TABLE IF NOT EXISTS detection_runs (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL UNIQUE,
            documents INTEGER NOT NULL,
            skipped INTEGER NOT NULL DEFAULT 0,
            sample_warnings INTEGER NOT NULL DEFAULT 0,
            anomalies INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_detection_runs_started ON detection_runs(started_at);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM baselines", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM detection_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_detection_runs_has_sample_warnings() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO detection_runs (run_id, documents, anomalies, started_at, finished_at)
             VALUES ('r1', 1, 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:01Z')",
            [],
        )
        .unwrap();
        let warnings: i64 = conn
            .query_row("SELECT sample_warnings FROM detection_runs WHERE run_id = 'r1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(warnings, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
