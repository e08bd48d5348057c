//! Reasoning Spine - explainable runs over a knowledge vault
//!
//! Every run produces a reasoning graph: an ordered, typed event log plus
//! the evidence it bound and the outcomes it reached. Around that graph:
//!
//! - **Scorer**: ranks vault candidates for the pointers a skill needs and
//!   proposes bindings above a confidence threshold
//! - **Runners**: deterministic, model-planner (fallback) and multi-agent
//!   (scaffold) strategies sharing one event contract
//! - **Learning loop**: credits evidence after each run and feeds the
//!   average contribution back into scoring
//! - **Ledger**: signed, hash-chained record of every finished graph
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use reasoning_spine::{Spine, SpineConfig, RunContext, Pointer, VaultRef};
//!
//! let spine = Spine::init(SpineConfig::load(&data_dir)?)?;
//! let context = RunContext::new("run-42", "scope-1", "Site survey")
//!     .with_binding(Pointer::parse("/inputs/site")?, VaultRef::new("obj-7"))
//!     .with_required(vec![Pointer::parse("/inputs/site")?]);
//!
//! let run = spine.run(None, &context, Some(&records)).await;
//! assert!(run.violations.is_empty());
//! ```
//!
//! # Architecture
//!
//! ```text
//! RunContext + CandidateRecords
//!        │
//!        ▼
//!  RunnerRegistry ──► Runner.execute() ──► ReasoningGraph ──► GraphLedger
//!        ▲                                        │
//!        │ historical contribution                ▼
//!      Scorer ◄──────────────────────────── LearningLoop ──► UsageStore
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod learning;
pub mod ledger;
pub mod legacy;
pub mod provenance;
pub mod runner;
pub mod scorer;
pub mod spine;
pub mod types;

// Core types
pub use error::SpineError;
pub use graph::{
    merge_graphs, EventKind, EventPayload, EvidenceRecord, OutcomeRecord, ReasoningEvent, ReasoningGraph,
    ReviewAction, RunStatus,
};
pub use types::*;

// Scoring
pub use scorer::{auto_fill_mapping, compute_readiness, suggest_inputs, InputRequirements, ReadinessOptions};

// Runners
pub use runner::{CandidateIndex, RunResult, Runner, RunnerRegistry};

// Learning loop
pub use learning::{compute_contributions, EvidenceUsageRecord, LearningLoop, LearningLoopResult, UsageStore};

// Persistence and provenance
pub use db::init_db;
pub use ledger::{ChainVerification, GraphLedger};
pub use legacy::{extract_graph, to_legacy_log, LegacyEvent};

// Orchestration
pub use config::SpineConfig;
pub use spine::{Spine, SpineRun};
