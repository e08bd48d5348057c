//! Spine - the orchestration root
//!
//! Owns the pieces a host application wires together once at startup:
//! 1. `SpineConfig` - thresholds, weights, data directory
//! 2. `RunnerRegistry` - strategies, read-only after construction
//! 3. `LearningLoop` - usage store and historical contributions
//! 4. `GraphLedger` - signed, chained record of every finished graph
//!
//! ```rust,ignore
//! let spine = Spine::init(SpineConfig::load(&data_dir)?)?;
//! let run = spine.run(Some("deterministic"), &context, Some(&records)).await;
//! println!("{}", run.result.status.name());
//! ```

use crate::config::SpineConfig;
use crate::graph::{ReasoningEvent, ReviewAction};
use crate::learning::{LearningConfig, LearningLoop, LearningLoopResult, LearningStats, SqliteUsageStore};
use crate::ledger::{ChainVerification, GraphLedger, LedgerEntry};
use crate::runner::{CandidateIndex, RunResult, RunnerRegistry};
use crate::scorer::{auto_fill_mapping, AutoFillResult, InputRequirements, ReadinessOptions};
use crate::types::{CandidateRecord, RunContext};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

/// Everything produced by one orchestrated run
#[derive(Debug, Clone, Serialize)]
pub struct SpineRun {
    pub strategy: String,
    pub result: RunResult,
    pub learning: LearningLoopResult,
    /// `None` when sealing failed; see `ledger_error`
    pub ledger_entry: Option<LedgerEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_error: Option<String>,
    /// Graph contract violations; empty for a well-formed graph
    pub violations: Vec<String>,
}

pub struct Spine {
    config: SpineConfig,
    registry: RunnerRegistry,
    learning: LearningLoop,
    ledger: GraphLedger,
}

impl Spine {
    /// Open the on-disk usage store and ledger under `config.data_dir`
    pub fn init(config: SpineConfig) -> Result<Self> {
        config.validate()?;
        let db_path = config.db_path();

        let store = SqliteUsageStore::open(&db_path, config.usage_cap)
            .with_context(|| format!("Failed to open usage store at {:?}", db_path))?;
        let ledger = GraphLedger::open(&db_path, &config.key_path())?;
        let learning = LearningLoop::new(LearningConfig::from(&config), Arc::new(store));

        tracing::info!(data_dir = ?config.data_dir, "spine initialised");
        Ok(Self {
            registry: RunnerRegistry::with_defaults(),
            config,
            learning,
            ledger,
        })
    }

    /// Everything in memory; nothing outlives the process
    pub fn in_memory(config: SpineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: RunnerRegistry::with_defaults(),
            learning: LearningLoop::in_memory(LearningConfig::from(&config)),
            ledger: GraphLedger::in_memory()?,
            config,
        })
    }

    /// Replace the default strategies
    pub fn with_registry(mut self, registry: RunnerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &SpineConfig {
        &self.config
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn learning(&self) -> &LearningLoop {
        &self.learning
    }

    pub fn ledger(&self) -> &GraphLedger {
        &self.ledger
    }

    /// Scoring options for `records`: configured threshold and weights plus history
    pub fn readiness_options(&self, records: &[CandidateRecord]) -> ReadinessOptions {
        let mut object_ids: Vec<String> = records.iter().map(|r| r.object_id.clone()).collect();
        object_ids.sort();
        object_ids.dedup();

        ReadinessOptions::at(Utc::now())
            .with_min_confidence(self.config.min_confidence)
            .with_weights(self.config.weights)
            .with_historical(self.learning.historical_contributions(&object_ids))
    }

    /// Suggested mapping for a skill's declared inputs
    pub fn readiness(&self, requirements: &InputRequirements, records: &[CandidateRecord]) -> AutoFillResult {
        auto_fill_mapping(requirements, records, &self.readiness_options(records))
    }

    /// Execute a run, seal its graph and feed the learning loop
    ///
    /// Persistence failures are reported on the returned `SpineRun`; the
    /// finished graph is always handed back.
    pub async fn run(
        &self,
        strategy: Option<&str>,
        context: &RunContext,
        records: Option<&[CandidateRecord]>,
    ) -> SpineRun {
        let requested = strategy.unwrap_or(self.config.default_strategy.as_str());
        let runner = self.registry.get(Some(requested));
        let index = records.map(|r| CandidateIndex::new(r.to_vec()).with_options(self.readiness_options(r)));

        tracing::info!(run_id = %context.run_id, strategy = runner.name(), "run started");
        let result = runner.execute(context, index.as_ref()).await;

        let violations = result.graph.contract_violations();
        if !violations.is_empty() {
            tracing::warn!(run_id = %context.run_id, ?violations, "graph contract violated");
        }

        let (ledger_entry, ledger_error) = match self.ledger.append(&result.graph) {
            Ok(entry) => (Some(entry), None),
            Err(e) => {
                tracing::error!(run_id = %context.run_id, "Failed to seal graph: {:#}", e);
                (None, Some(format!("Failed to seal graph for run {}: {:#}", context.run_id, e)))
            }
        };
        let learning = self.learning.process_run_completion(context, &result.graph);

        tracing::info!(
            run_id = %context.run_id,
            status = result.status.name(),
            evidence = result.graph.evidence.len(),
            "run finished"
        );

        SpineRun {
            strategy: runner.name().to_string(),
            result,
            learning,
            ledger_entry,
            ledger_error,
            violations,
        }
    }

    /// Record a human review decision on a vault object
    pub fn review(&self, object_id: &str, action: ReviewAction, updates: serde_json::Value) -> ReasoningEvent {
        self.learning.process_review_update(object_id, action, updates)
    }

    pub fn verify_ledger(&self) -> Result<ChainVerification> {
        self.ledger.verify_chain()
    }

    pub fn stats(&self) -> Result<LearningStats> {
        self.learning.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EventKind, RunStatus};
    use crate::runner::{MODEL_PLANNER, PLANNER_FALLBACK_PHRASE};
    use crate::types::{Pointer, Relevance, VaultRef};
    use tempfile::tempdir;

    fn ptr(s: &str) -> Pointer {
        Pointer::parse(s).unwrap()
    }

    fn records() -> Vec<CandidateRecord> {
        vec![CandidateRecord {
            object_id: "obj-site".into(),
            record_type: "document".into(),
            pointer: ptr("/inputs/site"),
            value: serde_json::json!("Rotterdam"),
            confidence: 0.9,
            relevance: Relevance::High,
            updated_at: Utc::now(),
            provenance: None,
        }]
    }

    fn context(run_id: &str) -> RunContext {
        RunContext::new(run_id, "scope-1", "Site survey")
            .with_binding(ptr("/inputs/site"), VaultRef::new("obj-site"))
            .with_required(vec![ptr("/inputs/site")])
    }

    fn setup_spine(persist_usage: bool) -> (Spine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = SpineConfig {
            data_dir: dir.path().to_path_buf(),
            persist_usage,
            ..Default::default()
        };
        (Spine::init(config).unwrap(), dir)
    }

    #[tokio::test]
    async fn test_run_seals_and_learns() {
        let (spine, _dir) = setup_spine(true);
        let recs = records();

        let run = spine.run(None, &context("run-1"), Some(&recs)).await;

        assert_eq!(run.strategy, "deterministic");
        assert_eq!(run.result.status, RunStatus::Complete);
        assert!(run.violations.is_empty(), "{:?}", run.violations);
        assert_eq!(run.learning.persisted_count, 1);
        let sealed = spine.ledger().load("run-1").unwrap().unwrap();
        assert_eq!(sealed.events.len(), run.result.graph.events.len());
        assert_eq!(run.ledger_entry.as_ref().unwrap().run_id, "run-1");
        assert!(run.ledger_error.is_none());
        assert!(spine.verify_ledger().unwrap().valid);

        // History flows back into the next scoring pass
        let options = spine.readiness_options(&recs);
        assert_eq!(options.historical.get("obj-site"), Some(&1.0));
    }

    #[tokio::test]
    async fn test_run_with_named_strategy() {
        let (spine, _dir) = setup_spine(false);

        let run = spine.run(Some(MODEL_PLANNER), &context("run-2"), None).await;

        assert_eq!(run.strategy, MODEL_PLANNER);
        let note = &run.result.graph.events[1];
        assert_eq!(note.kind(), EventKind::ReasoningStep);
        assert!(note.summary.as_deref().unwrap().contains(PLANNER_FALLBACK_PHRASE));
        assert_eq!(run.learning.persisted_count, 0);
        assert_eq!(spine.stats().unwrap().total_records, 0);
    }

    #[tokio::test]
    async fn test_ledger_failure_still_returns_run_and_learns() {
        let (spine, _dir) = setup_spine(true);
        let conn = rusqlite::Connection::open(spine.config().db_path()).unwrap();
        conn.execute("DROP TABLE graph_ledger", []).unwrap();

        let run = spine.run(None, &context("run-x"), Some(&records())).await;

        assert_eq!(run.result.status, RunStatus::Complete);
        assert!(run.ledger_entry.is_none());
        assert!(run.ledger_error.as_deref().unwrap().contains("run-x"));
        assert_eq!(run.learning.persisted_count, 1);
        assert_eq!(spine.stats().unwrap().total_records, 1);
    }

    #[test]
    fn test_readiness_uses_configured_threshold() {
        let config = SpineConfig {
            min_confidence: 0.95,
            ..Default::default()
        };
        let spine = Spine::in_memory(config).unwrap();
        let requirements = InputRequirements {
            required: vec![ptr("/inputs/site")],
            optional: vec![],
        };

        let fill = spine.readiness(&requirements, &records());
        assert!(fill.mapping.is_empty());
        assert_eq!(fill.unbound_required, vec![ptr("/inputs/site")]);
    }

    #[test]
    fn test_review_event() {
        let spine = Spine::in_memory(SpineConfig::default()).unwrap();
        let event = spine.review("obj-site", ReviewAction::Accepted, serde_json::json!({}));
        assert_eq!(event.run_id, "review-obj-site");
    }
}
