//! Graph ledger - append-only store of sealed reasoning graphs
//!
//! Entries are keyed by run and chained: each seal covers the previous
//! entry's content hash, so `verify_chain` finds edits, deletions and
//! reordering anywhere in the history.

use crate::db::{init_db, init_schema};
use crate::error::SpineError;
use crate::graph::{new_id, ReasoningGraph};
use crate::provenance::{verify_seal, LedgerKey, Seal};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: i64,
    pub entry_id: String,
    pub run_id: String,
    pub sealed_at: DateTime<Utc>,
    pub graph_json: String,
    pub seal: Seal,
}

impl LedgerEntry {
    pub fn graph(&self) -> Result<ReasoningGraph> {
        serde_json::from_str(&self.graph_json)
            .with_context(|| format!("Failed to parse sealed graph for run {}", self.run_id))
    }
}

/// Result of chain verification
#[derive(Debug, Clone, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub errors: Vec<String>,
    pub chain_length: usize,
}

pub struct GraphLedger {
    conn: Mutex<Connection>,
    key: LedgerKey,
}

const SELECT_ENTRY: &str = "SELECT seq, entry_id, run_id, sealed_at, graph_json,
        content_hash, previous_hash, signature, public_key
 FROM graph_ledger";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let sealed_at: String = row.get(3)?;
    let sealed_at = DateTime::parse_from_rfc3339(&sealed_at)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(LedgerEntry {
        seq: row.get(0)?,
        entry_id: row.get(1)?,
        run_id: row.get(2)?,
        sealed_at,
        graph_json: row.get(4)?,
        seal: Seal {
            content_hash: row.get(5)?,
            previous_hash: row.get(6)?,
            signature: row.get(7)?,
            public_key: row.get(8)?,
        },
    })
}

impl GraphLedger {
    pub fn open(db_path: &Path, key_path: &Path) -> Result<Self> {
        let conn = init_db(db_path)?;
        let key = LedgerKey::init(key_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    /// Ledger that lives only as long as the process, with a throwaway key
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: LedgerKey::ephemeral(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SpineError::Persistence("graph ledger lock poisoned".to_string()).into())
    }

    pub fn public_key_hex(&self) -> String {
        self.key.public_key_hex()
    }

    /// Seal a finished graph and append it to the chain
    pub fn append(&self, graph: &ReasoningGraph) -> Result<LedgerEntry> {
        let graph_json = serde_json::to_string(graph).context("Failed to serialize graph")?;

        let mut conn = self.lock()?;
        // IMMEDIATE so two writers cannot both chain onto the same tail
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin ledger transaction")?;

        let previous_hash: Option<String> = tx
            .query_row(
                "SELECT content_hash FROM graph_ledger ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let seal = self
            .key
            .seal(&graph.run_id, graph_json.as_bytes(), previous_hash.as_deref());
        let entry_id = new_id("ledger");
        let sealed_at = Utc::now();

        tx.execute(
            "INSERT INTO graph_ledger
             (entry_id, run_id, sealed_at, graph_json, content_hash, previous_hash, signature, public_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry_id,
                graph.run_id,
                sealed_at.to_rfc3339(),
                graph_json,
                seal.content_hash,
                seal.previous_hash,
                seal.signature,
                seal.public_key,
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit().context("Failed to commit ledger entry")?;

        tracing::debug!(run_id = %graph.run_id, seq, "graph sealed");
        Ok(LedgerEntry {
            seq,
            entry_id,
            run_id: graph.run_id.clone(),
            sealed_at,
            graph_json,
            seal,
        })
    }

    /// Latest sealed graph for a run
    pub fn load(&self, run_id: &str) -> Result<Option<ReasoningGraph>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                &format!("{} WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1", SELECT_ENTRY),
                params![run_id],
                row_to_entry,
            )
            .optional()?;
        drop(conn);

        entry.map(|e| e.graph()).transpose()
    }

    /// Most recent entries, newest first
    pub fn history(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY seq DESC LIMIT ?1", SELECT_ENTRY))?;
        let entries = stmt
            .query_map(params![limit as i64], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Every entry in chain order
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY seq ASC", SELECT_ENTRY))?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Walk the whole chain checking links, hashes and signatures
    pub fn verify_chain(&self) -> Result<ChainVerification> {
        let entries = self.entries()?;
        Ok(verify_entries(&entries))
    }
}

/// Verify a chain of entries given in chain order
pub fn verify_entries(entries: &[LedgerEntry]) -> ChainVerification {
    let mut errors = Vec::new();
    let mut prev_hash: Option<&str> = None;

    for (i, entry) in entries.iter().enumerate() {
        if entry.seal.previous_hash.as_deref() != prev_hash {
            errors.push(format!(
                "Chain break at position {}: expected prev_hash {:?}, got {:?}",
                i, prev_hash, entry.seal.previous_hash
            ));
        }

        match verify_seal(&entry.run_id, entry.graph_json.as_bytes(), &entry.seal) {
            Ok(true) => {}
            Ok(false) => errors.push(format!(
                "Invalid seal at position {} (run {}): content or signature does not match",
                i, entry.run_id
            )),
            Err(e) => errors.push(format!("Seal verification error at position {}: {}", i, e)),
        }

        prev_hash = Some(&entry.seal.content_hash);
    }

    ChainVerification {
        valid: errors.is_empty(),
        errors,
        chain_length: entries.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn graph(run_id: &str) -> ReasoningGraph {
        ReasoningGraph::empty(run_id)
    }

    fn setup_ledger() -> (GraphLedger, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let ledger = GraphLedger::open(&dir.path().join("spine.db"), &dir.path().join("ledger.key")).unwrap();
        (ledger, dir)
    }

    #[test]
    fn test_append_and_load() {
        let (ledger, _dir) = setup_ledger();
        ledger.append(&graph("run-1")).unwrap();
        ledger.append(&graph("run-2")).unwrap();

        let loaded = ledger.load("run-1").unwrap().unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert!(ledger.load("run-unknown").unwrap().is_none());

        let history = ledger.history(10).unwrap();
        assert_eq!(history[0].run_id, "run-2");
        assert_eq!(history[0].seal.previous_hash.as_deref(), Some(history[1].seal.content_hash.as_str()));
    }

    #[test]
    fn test_chain_valid_across_reopen() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("spine.db");
        let key = dir.path().join("ledger.key");
        {
            let ledger = GraphLedger::open(&db, &key).unwrap();
            ledger.append(&graph("run-1")).unwrap();
        }
        let ledger = GraphLedger::open(&db, &key).unwrap();
        ledger.append(&graph("run-2")).unwrap();

        let result = ledger.verify_chain().unwrap();
        assert!(result.valid, "Chain should be valid: {:?}", result.errors);
        assert_eq!(result.chain_length, 2);
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let ledger = GraphLedger::in_memory().unwrap();
        let result = ledger.verify_chain().unwrap();
        assert!(result.valid);
        assert_eq!(result.chain_length, 0);
    }

    #[test]
    fn test_detects_tampered_graph() {
        let ledger = GraphLedger::in_memory().unwrap();
        ledger.append(&graph("run-1")).unwrap();
        ledger.append(&graph("run-2")).unwrap();

        let tampered = serde_json::to_string(&graph("run-forged")).unwrap();
        ledger
            .lock()
            .unwrap()
            .execute("UPDATE graph_ledger SET graph_json = ?1 WHERE run_id = 'run-1'", params![tampered])
            .unwrap();

        let result = ledger.verify_chain().unwrap();
        assert!(!result.valid);
        assert!(result.errors[0].contains("position 0"));
    }

    #[test]
    fn test_detects_deleted_entry() {
        let ledger = GraphLedger::in_memory().unwrap();
        for run in ["run-1", "run-2", "run-3"] {
            ledger.append(&graph(run)).unwrap();
        }
        ledger
            .lock()
            .unwrap()
            .execute("DELETE FROM graph_ledger WHERE run_id = 'run-2'", [])
            .unwrap();

        let result = ledger.verify_chain().unwrap();
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("Chain break at position 1")));
    }
}
