//! Learning Loop - closes the scoring flywheel
//!
//! After a run finishes this module:
//! 1. Splits each outcome's credit across the evidence it cites
//! 2. Records one usage entry per evidence item (optionally persisted)
//! 3. Emits one `vault.mutated` event per vault object
//! 4. Serves the mean historical contribution back to the scorer
//!
//! Graphs and contexts are only read; nothing is written back into them.

pub mod store;

pub use store::{MemoryUsageStore, SqliteUsageStore, UsageStore};

use crate::config::{SpineConfig, DEFAULT_USAGE_CAP};
use crate::graph::*;
use crate::types::{Relevance, RunContext};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Score given to evidence that carries neither a score snapshot nor a confidence
pub const NEUTRAL_EVIDENCE_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Write run-derived usage to the store; off means events only
    pub persist_usage: bool,
    pub usage_cap: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            persist_usage: false,
            usage_cap: DEFAULT_USAGE_CAP,
        }
    }
}

impl From<&SpineConfig> for LearningConfig {
    fn from(config: &SpineConfig) -> Self {
        Self {
            persist_usage: config.persist_usage,
            usage_cap: config.usage_cap,
        }
    }
}

/// How much one vault object helped one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceUsageRecord {
    pub vault_object_id: String,
    pub pointer_path: String,
    pub used_in_run_id: String,
    /// Weight in [0, 1] of this evidence within the outcome it supported
    pub outcome_contribution: f64,
    pub timestamp: DateTime<Utc>,
    pub confidence_snapshot: Option<f64>,
    pub relevance_snapshot: Option<Relevance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningLoopResult {
    pub events: Vec<ReasoningEvent>,
    pub evidence_usage_records: Vec<EvidenceUsageRecord>,
    pub persisted_count: usize,
    /// Evidence items that produced no usage record
    pub skipped_count: usize,
    pub errors: Vec<String>,
}

/// Split credit among the evidence behind one outcome
///
/// Each item scores its snapshot total, else its confidence, else 0.5;
/// weights are the normalised scores, or an equal split when every score
/// is zero. Returned in input order.
pub fn compute_contributions(evidence: &[&EvidenceRecord]) -> Vec<f64> {
    if evidence.is_empty() {
        return Vec::new();
    }

    let scores: Vec<f64> = evidence
        .iter()
        .map(|e| {
            e.score_snapshot
                .as_ref()
                .map(|s| s.total)
                .or(e.confidence)
                .unwrap_or(NEUTRAL_EVIDENCE_SCORE)
                .max(0.0)
        })
        .collect();
    let total: f64 = scores.iter().sum();

    if total <= 0.0 {
        let equal = 1.0 / evidence.len() as f64;
        return vec![equal; evidence.len()];
    }
    scores.iter().map(|s| s / total).collect()
}

/// Usage store summary
#[derive(Debug, Clone, Serialize)]
pub struct LearningStats {
    pub total_records: usize,
    pub cap: usize,
    pub distinct_objects: usize,
    pub runs_covered: usize,
    pub mean_contribution: f64,
    /// (object id, mean contribution, record count), best first
    pub top_objects: Vec<(String, f64, usize)>,
}

pub struct LearningLoop {
    config: LearningConfig,
    store: Arc<dyn UsageStore>,
}

impl LearningLoop {
    pub fn new(config: LearningConfig, store: Arc<dyn UsageStore>) -> Self {
        Self { config, store }
    }

    /// Loop backed by a fresh in-memory store
    pub fn in_memory(config: LearningConfig) -> Self {
        let store = Arc::new(MemoryUsageStore::new(config.usage_cap));
        Self::new(config, store)
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }

    /// Derive usage records and mutation events from a finished run
    pub fn process_run_completion(&self, context: &RunContext, graph: &ReasoningGraph) -> LearningLoopResult {
        if graph.run_id != context.run_id {
            let error = format!("graph run {} does not match context run {}", graph.run_id, context.run_id);
            tracing::warn!(run_id = %context.run_id, "{}", error);
            return LearningLoopResult {
                events: Vec::new(),
                evidence_usage_records: Vec::new(),
                persisted_count: 0,
                skipped_count: graph.evidence.len(),
                errors: vec![error],
            };
        }

        let mut errors = Vec::new();

        // Max weight per evidence across all outcomes citing it
        let mut weights: HashMap<&str, f64> = HashMap::new();
        for outcome in &graph.outcomes {
            let cited: Vec<&EvidenceRecord> = outcome
                .evidence_ids
                .iter()
                .filter_map(|id| graph.evidence_by_id(id))
                .filter(|e| e.vault_object_id.is_some())
                .collect();
            for (evidence, weight) in cited.iter().zip(compute_contributions(&cited)) {
                let entry = weights.entry(evidence.evidence_id.as_str()).or_insert(0.0);
                *entry = entry.max(weight);
            }
        }

        let now = Utc::now();
        let mut records = Vec::new();
        let mut skipped_count = 0;
        for evidence in &graph.evidence {
            let (Some(object_id), Some(weight)) = (&evidence.vault_object_id, weights.get(evidence.evidence_id.as_str()))
            else {
                skipped_count += 1;
                continue;
            };
            records.push(EvidenceUsageRecord {
                vault_object_id: object_id.clone(),
                pointer_path: evidence
                    .pointer
                    .as_ref()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default(),
                used_in_run_id: context.run_id.clone(),
                outcome_contribution: weight.clamp(0.0, 1.0),
                timestamp: now,
                confidence_snapshot: evidence.confidence,
                relevance_snapshot: evidence.relevance,
            });
        }

        let mut persisted_count = 0;
        let mut persisted = false;
        if self.config.persist_usage && !records.is_empty() {
            match self.store.append(&records) {
                Ok(n) => {
                    persisted_count = n;
                    persisted = true;
                }
                Err(e) => {
                    tracing::warn!(run_id = %context.run_id, error = %e, "failed to persist evidence usage");
                    errors.push(format!("{:#}", e));
                }
            }
        }

        let mut by_object: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for record in &records {
            by_object
                .entry(record.vault_object_id.as_str())
                .or_default()
                .push(record.outcome_contribution);
        }
        let events = by_object
            .into_iter()
            .map(|(object_id, contributions)| {
                let average = contributions.iter().sum::<f64>() / contributions.len() as f64;
                ReasoningEvent::new(
                    &context.run_id,
                    format!("Usage recorded for {}", object_id),
                    EventPayload::VaultMutated {
                        vault_object_id: object_id.to_string(),
                        change: VaultChange::UsageRecorded {
                            average_contribution: average,
                            entry_count: contributions.len(),
                        },
                        persisted,
                    },
                )
                .with_summary(format!(
                    "Average contribution {:.2} over {} evidence item(s)",
                    average,
                    contributions.len()
                ))
            })
            .collect();

        tracing::info!(
            run_id = %context.run_id,
            records = records.len(),
            persisted_count,
            skipped_count,
            "learning loop processed run"
        );

        LearningLoopResult {
            events,
            evidence_usage_records: records,
            persisted_count,
            skipped_count,
            errors,
        }
    }

    /// Mean stored contribution of one object, 0 without history
    pub fn historical_contribution(&self, object_id: &str) -> f64 {
        self.historical_contributions(&[object_id.to_string()])
            .get(object_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Batch form; objects without history are absent from the map
    pub fn historical_contributions(&self, object_ids: &[String]) -> HashMap<String, f64> {
        match self.store.mean_contributions(object_ids) {
            Ok(means) => means,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read historical contributions");
                HashMap::new()
            }
        }
    }

    /// Event for a human review decision on a vault object
    pub fn process_review_update(
        &self,
        object_id: &str,
        action: ReviewAction,
        updates: serde_json::Value,
    ) -> ReasoningEvent {
        let verb = match action {
            ReviewAction::Accepted => "accepted",
            ReviewAction::Blocked => "blocked",
        };
        tracing::info!(object_id, action = verb, "vault review recorded");

        ReasoningEvent::new(
            &format!("review-{}", object_id),
            format!("Review {}: {}", verb, object_id),
            EventPayload::VaultMutated {
                vault_object_id: object_id.to_string(),
                change: VaultChange::Reviewed { action, updates },
                persisted: true,
            },
        )
    }

    /// Summarise the usage store
    pub fn stats(&self) -> Result<LearningStats> {
        let records = self.store.recent(self.store.cap())?;

        let mut per_object: HashMap<&str, (f64, usize)> = HashMap::new();
        let mut runs = std::collections::HashSet::new();
        for r in &records {
            let entry = per_object.entry(r.vault_object_id.as_str()).or_insert((0.0, 0));
            entry.0 += r.outcome_contribution;
            entry.1 += 1;
            runs.insert(r.used_in_run_id.as_str());
        }

        let mut top_objects: Vec<(String, f64, usize)> = per_object
            .iter()
            .map(|(id, (sum, count))| (id.to_string(), sum / *count as f64, *count))
            .collect();
        top_objects.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_objects.truncate(5);

        let mean_contribution = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.outcome_contribution).sum::<f64>() / records.len() as f64
        };

        Ok(LearningStats {
            total_records: records.len(),
            cap: self.store.cap(),
            distinct_objects: per_object.len(),
            runs_covered: runs.len(),
            mean_contribution,
            top_objects,
        })
    }
}

/// Print learning statistics in a human-readable format
pub fn print_learning_stats(stats: &LearningStats) {
    println!("\nLEARNING LOOP STATUS\n");

    if stats.total_records == 0 {
        println!("No evidence usage recorded yet.");
        println!("   Enable persist_usage in config.json and complete a run to start learning.");
        return;
    }

    println!("USAGE:");
    println!("   Records: {} / {}", stats.total_records, stats.cap);
    println!("   Vault objects: {}", stats.distinct_objects);
    println!("   Runs: {}", stats.runs_covered);
    println!("   Mean contribution: {:.2}", stats.mean_contribution);
    println!();

    if !stats.top_objects.is_empty() {
        println!("TOP CONTRIBUTORS:");
        for (object_id, mean, count) in &stats.top_objects {
            println!("   {:.2} ({} uses) - {}", mean, count, object_id);
        }
        println!();
    }
}
