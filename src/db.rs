//! Database layer for the reasoning spine
//!
//! One SQLite file, two tables:
//! 1. `evidence_usage` - learning loop history, keyed by
//!    (object, pointer, run) and trimmed to a cap, newest first
//! 2. `graph_ledger` - sealed reasoning graphs and their provenance chain

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

/// Initialize the database with schema
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory {:?}", parent))?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {:?}", path))?;

    init_schema(&conn)?;

    Ok(conn)
}

/// Create tables on an already open connection
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("Failed to create spine schema")?;
    Ok(())
}

const SCHEMA: &str = r#"
-- Evidence usage: how much each vault object contributed to each run
CREATE TABLE IF NOT EXISTS evidence_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vault_object_id TEXT NOT NULL,
    pointer_path TEXT NOT NULL,
    used_in_run_id TEXT NOT NULL,
    outcome_contribution REAL NOT NULL,
    timestamp TEXT NOT NULL,
    confidence_snapshot REAL,
    relevance_snapshot TEXT,         -- high | medium | low
    UNIQUE(vault_object_id, pointer_path, used_in_run_id)
);

CREATE INDEX IF NOT EXISTS idx_usage_object ON evidence_usage(vault_object_id);

-- Graph ledger: append-only, each entry chained to the previous one
CREATE TABLE IF NOT EXISTS graph_ledger (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id TEXT NOT NULL UNIQUE,
    run_id TEXT NOT NULL,
    sealed_at TEXT NOT NULL,
    graph_json TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    previous_hash TEXT,
    signature TEXT NOT NULL,
    public_key TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_run ON graph_ledger(run_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_db_creates_tables() {
        let dir = tempdir().unwrap();
        let conn = init_db(&dir.path().join("nested").join("spine.db")).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(tables, vec!["evidence_usage", "graph_ledger"]);
    }

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }
}
