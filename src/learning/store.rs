//! Evidence usage stores
//!
//! Both stores apply a batch atomically: insert (replacing any record with
//! the same object/pointer/run key) and trim to the cap happen under one
//! transaction or one lock. Listing is newest first.

use super::EvidenceUsageRecord;
use crate::db::{init_db, init_schema};
use crate::error::SpineError;
use crate::types::Relevance;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub trait UsageStore: Send + Sync {
    /// Insert a batch and trim to the cap; returns how many of the batch are still stored
    fn append(&self, records: &[EvidenceUsageRecord]) -> Result<usize>;

    /// Up to `limit` records, newest first
    fn recent(&self, limit: usize) -> Result<Vec<EvidenceUsageRecord>>;

    /// Every stored record for one vault object
    fn records_for(&self, object_id: &str) -> Result<Vec<EvidenceUsageRecord>>;

    fn len(&self) -> Result<usize>;

    fn cap(&self) -> usize;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Mean contribution per object; objects without history are omitted
    fn mean_contributions(&self, object_ids: &[String]) -> Result<HashMap<String, f64>> {
        let mut means = HashMap::new();
        for id in object_ids {
            let records = self.records_for(id)?;
            if !records.is_empty() {
                let sum: f64 = records.iter().map(|r| r.outcome_contribution).sum();
                means.insert(id.clone(), sum / records.len() as f64);
            }
        }
        Ok(means)
    }
}

fn poisoned() -> anyhow::Error {
    SpineError::Persistence("usage store lock poisoned".to_string()).into()
}

fn same_key(a: &EvidenceUsageRecord, b: &EvidenceUsageRecord) -> bool {
    a.vault_object_id == b.vault_object_id
        && a.pointer_path == b.pointer_path
        && a.used_in_run_id == b.used_in_run_id
}

// ============================================================================
// SQLite
// ============================================================================

pub struct SqliteUsageStore {
    conn: Mutex<Connection>,
    cap: usize,
}

impl SqliteUsageStore {
    pub fn open(path: &Path, cap: usize) -> Result<Self> {
        let conn = init_db(path)?;
        Ok(Self::with_connection(conn, cap))
    }

    pub fn in_memory(cap: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        init_schema(&conn)?;
        Ok(Self::with_connection(conn, cap))
    }

    fn with_connection(conn: Connection, cap: usize) -> Self {
        Self {
            conn: Mutex::new(conn),
            cap: cap.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| poisoned())
    }

    fn query(&self, sql: &str, param: rusqlite::types::Value) -> Result<Vec<EvidenceUsageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map([param], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

const SELECT_USAGE: &str = "SELECT vault_object_id, pointer_path, used_in_run_id, outcome_contribution,
        timestamp, confidence_snapshot, relevance_snapshot
 FROM evidence_usage";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvidenceUsageRecord> {
    let timestamp: String = row.get(4)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?;
    let relevance: Option<String> = row.get(6)?;

    Ok(EvidenceUsageRecord {
        vault_object_id: row.get(0)?,
        pointer_path: row.get(1)?,
        used_in_run_id: row.get(2)?,
        outcome_contribution: row.get(3)?,
        timestamp,
        confidence_snapshot: row.get(5)?,
        relevance_snapshot: relevance.as_deref().and_then(Relevance::from_name),
    })
}

impl UsageStore for SqliteUsageStore {
    fn append(&self, records: &[EvidenceUsageRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin usage transaction")?;

        let mut row_ids = Vec::with_capacity(records.len());
        {
            // REPLACE deletes the old row, so a retried run moves to the front
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO evidence_usage
                 (vault_object_id, pointer_path, used_in_run_id, outcome_contribution,
                  timestamp, confidence_snapshot, relevance_snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.vault_object_id,
                    r.pointer_path,
                    r.used_in_run_id,
                    r.outcome_contribution,
                    r.timestamp.to_rfc3339(),
                    r.confidence_snapshot,
                    r.relevance_snapshot.map(|rel| rel.name()),
                ])?;
                row_ids.push(tx.last_insert_rowid());
            }
        }

        let trimmed = tx.execute(
            "DELETE FROM evidence_usage
             WHERE id NOT IN (SELECT id FROM evidence_usage ORDER BY id DESC LIMIT ?1)",
            params![self.cap as i64],
        )?;

        // A duplicate key later in the batch or the trim may have removed rows
        let mut kept = 0;
        {
            let mut exists = tx.prepare("SELECT COUNT(*) FROM evidence_usage WHERE id = ?1")?;
            for id in &row_ids {
                let count: i64 = exists.query_row(params![id], |row| row.get(0))?;
                kept += count as usize;
            }
        }
        tx.commit().context("Failed to commit usage records")?;

        if trimmed > 0 {
            tracing::debug!(trimmed, cap = self.cap, "usage store trimmed");
        }
        Ok(kept)
    }

    fn recent(&self, limit: usize) -> Result<Vec<EvidenceUsageRecord>> {
        self.query(
            &format!("{} ORDER BY id DESC LIMIT ?1", SELECT_USAGE),
            rusqlite::types::Value::Integer(limit as i64),
        )
    }

    fn records_for(&self, object_id: &str) -> Result<Vec<EvidenceUsageRecord>> {
        self.query(
            &format!("{} WHERE vault_object_id = ?1 ORDER BY id DESC", SELECT_USAGE),
            rusqlite::types::Value::Text(object_id.to_string()),
        )
    }

    fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM evidence_usage", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn cap(&self) -> usize {
        self.cap
    }
}

// ============================================================================
// In-memory
// ============================================================================

pub struct MemoryUsageStore {
    records: Mutex<VecDeque<EvidenceUsageRecord>>,
    cap: usize,
}

impl MemoryUsageStore {
    pub fn new(cap: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            cap: cap.max(1),
        }
    }
}

impl UsageStore for MemoryUsageStore {
    fn append(&self, records: &[EvidenceUsageRecord]) -> Result<usize> {
        let mut stored = self.records.lock().map_err(|_| poisoned())?;
        for record in records {
            stored.retain(|existing| !same_key(existing, record));
            stored.push_front(record.clone());
        }
        stored.truncate(self.cap);
        // Older records sharing a batch key were removed above
        let kept = stored
            .iter()
            .filter(|existing| records.iter().any(|r| same_key(existing, r)))
            .count();
        Ok(kept)
    }

    fn recent(&self, limit: usize) -> Result<Vec<EvidenceUsageRecord>> {
        let stored = self.records.lock().map_err(|_| poisoned())?;
        Ok(stored.iter().take(limit).cloned().collect())
    }

    fn records_for(&self, object_id: &str) -> Result<Vec<EvidenceUsageRecord>> {
        let stored = self.records.lock().map_err(|_| poisoned())?;
        Ok(stored
            .iter()
            .filter(|r| r.vault_object_id == object_id)
            .cloned()
            .collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.lock().map_err(|_| poisoned())?.len())
    }

    fn cap(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn record(object_id: &str, run_id: &str, contribution: f64) -> EvidenceUsageRecord {
        EvidenceUsageRecord {
            vault_object_id: object_id.to_string(),
            pointer_path: "/inputs/site".to_string(),
            used_in_run_id: run_id.to_string(),
            outcome_contribution: contribution,
            timestamp: Utc::now(),
            confidence_snapshot: Some(0.8),
            relevance_snapshot: Some(Relevance::High),
        }
    }

    fn stores() -> Vec<Box<dyn UsageStore>> {
        vec![
            Box::new(SqliteUsageStore::in_memory(3).unwrap()),
            Box::new(MemoryUsageStore::new(3)),
        ]
    }

    #[test]
    fn test_cap_keeps_newest() {
        for store in stores() {
            for i in 0..5 {
                store.append(&[record("obj-1", &format!("run-{}", i), 0.5)]).unwrap();
            }
            assert_eq!(store.len().unwrap(), 3);
            let runs: Vec<String> = store.recent(10).unwrap().into_iter().map(|r| r.used_in_run_id).collect();
            assert_eq!(runs, vec!["run-4", "run-3", "run-2"]);
        }
    }

    #[test]
    fn test_append_counts_only_records_kept() {
        for store in stores() {
            let batch: Vec<EvidenceUsageRecord> =
                (0..5).map(|i| record(&format!("obj-{}", i), "run-a", 0.2)).collect();
            assert_eq!(store.append(&batch).unwrap(), 3);

            let duplicated = [record("obj-9", "run-b", 0.1), record("obj-9", "run-b", 0.3)];
            assert_eq!(store.append(&duplicated).unwrap(), 1);
            assert_eq!(store.len().unwrap(), 3);
        }
    }

    #[test]
    fn test_retried_run_replaces_record() {
        for store in stores() {
            store.append(&[record("obj-1", "run-a", 0.2)]).unwrap();
            store.append(&[record("obj-1", "run-b", 0.4)]).unwrap();
            store.append(&[record("obj-1", "run-a", 0.9)]).unwrap();

            let records = store.recent(10).unwrap();
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].used_in_run_id, "run-a");
            assert_eq!(records[0].outcome_contribution, 0.9);
        }
    }

    #[test]
    fn test_mean_contributions() {
        for store in stores() {
            store
                .append(&[record("obj-1", "run-a", 0.2), record("obj-1", "run-b", 0.6), record("obj-2", "run-a", 1.0)])
                .unwrap();

            let means = store
                .mean_contributions(&["obj-1".to_string(), "obj-2".to_string(), "obj-3".to_string()])
                .unwrap();
            assert!((means["obj-1"] - 0.4).abs() < 1e-9);
            assert_eq!(means["obj-2"], 1.0);
            assert!(!means.contains_key("obj-3"));
        }
    }

    #[test]
    fn test_sqlite_store_round_trips_snapshots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spine.db");
        {
            let store = SqliteUsageStore::open(&path, 10).unwrap();
            store.append(&[record("obj-1", "run-a", 0.5)]).unwrap();
        }

        let store = SqliteUsageStore::open(&path, 10).unwrap();
        let records = store.records_for("obj-1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].confidence_snapshot, Some(0.8));
        assert_eq!(records[0].relevance_snapshot, Some(Relevance::High));
    }

    #[test]
    fn test_concurrent_appends_lose_nothing() {
        let store = Arc::new(SqliteUsageStore::in_memory(1000).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store.append(&[record("obj-1", &format!("run-{}-{}", t, i), 0.5)]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len().unwrap(), 80);
    }
}
