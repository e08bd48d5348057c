//! Runners - strategies that turn a run context into a reasoning graph
//!
//! All strategies share one contract and one event order:
//!
//! ```text
//! run.started → step.started → [evidence.candidates_ranked] → evidence.bound*
//!   → reasoning.step → outcome.proposed → outcome.finalized
//!   → step.completed → run.completed | run.failed
//! ```
//!
//! Nothing a strategy does may escape as an error or a panic: the boundary
//! in [`guarded`] turns both into a `failed` run with a terminal
//! `run.failed` event.

pub mod deterministic;
pub mod model_planner;
pub mod multi_agent;
pub mod registry;

pub use deterministic::DeterministicRunner;
pub use model_planner::{ModelPlannerRunner, PLANNER_FALLBACK_PHRASE};
pub use multi_agent::MultiAgentRunner;
pub use registry::RunnerRegistry;

use crate::graph::*;
use crate::scorer::ReadinessOptions;
use crate::types::{CandidateRecord, RunContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};

pub const DETERMINISTIC: &str = "deterministic";
pub const MODEL_PLANNER: &str = "model_planner";
pub const MULTI_AGENT: &str = "multi_agent";

/// Step id used for the single binding step of a run
pub const BIND_STEP: &str = "bind-inputs";

/// Vault candidates offered to a run for advisory ranking
#[derive(Debug, Clone, Default)]
pub struct CandidateIndex {
    pub records: Vec<CandidateRecord>,
    pub options: ReadinessOptions,
}

impl CandidateIndex {
    pub fn new(records: Vec<CandidateRecord>) -> Self {
        Self {
            records,
            options: ReadinessOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ReadinessOptions) -> Self {
        self.options = options;
        self
    }
}

/// What a strategy hands back for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub graph: ReasoningGraph,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[async_trait]
pub trait Runner: Send + Sync {
    /// Registry name of the strategy
    fn name(&self) -> &str;

    /// Produce the reasoning graph for one run
    ///
    /// Async so a model-backed strategy can suspend; today's strategies
    /// complete synchronously.
    async fn execute(&self, context: &RunContext, index: Option<&CandidateIndex>) -> RunResult;
}

/// Run `build`, converting errors and panics into a failed run
pub(crate) fn guarded<F>(context: &RunContext, strategy: &str, build: F) -> RunResult
where
    F: FnOnce() -> anyhow::Result<RunResult>,
{
    match panic::catch_unwind(AssertUnwindSafe(build)) {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            let error = format!("{:#}", err);
            tracing::warn!(run_id = %context.run_id, strategy, %error, "run failed");
            failed_run(context, strategy, &error)
        }
        Err(payload) => {
            let error = match payload.downcast_ref::<&str>() {
                Some(s) => format!("panic: {}", s),
                None => match payload.downcast_ref::<String>() {
                    Some(s) => format!("panic: {}", s),
                    None => "panic: unknown payload".to_string(),
                },
            };
            tracing::warn!(run_id = %context.run_id, strategy, %error, "run panicked");
            failed_run(context, strategy, &error)
        }
    }
}

/// The graph of a run that could not be computed
pub(crate) fn failed_run(context: &RunContext, strategy: &str, error: &str) -> RunResult {
    let mut b = GraphBuilder::new(&context.run_id);
    b.emit(
        format!("Run started: {}", context.title),
        None,
        EventPayload::RunStarted {
            strategy: strategy.to_string(),
            scope_id: context.scope_id.clone(),
            input_count: context.input_bindings.len(),
        },
        vec![],
        vec![],
    );
    b.emit(
        "Execution failed",
        Some(error.to_string()),
        EventPayload::StepFailed {
            step_id: BIND_STEP.to_string(),
            error: error.to_string(),
        },
        vec![],
        vec![],
    );

    let outcome = OutcomeRecord::unscored(
        &context.run_id,
        RenderAs::Text,
        format!("{} could not be completed", context.title),
        OutcomeResult::Failure { error: error.to_string() },
        "The run failed before any result could be assessed",
    );
    let outcome_id = b.add_outcome(outcome);
    b.emit("Outcome proposed", None, EventPayload::OutcomeProposed, vec![], vec![outcome_id.clone()]);
    b.emit("Outcome finalized", None, EventPayload::OutcomeFinalized, vec![], vec![outcome_id]);
    b.emit(
        "Run failed",
        Some(error.to_string()),
        EventPayload::RunFailed { error: error.to_string() },
        vec![],
        vec![],
    );

    RunResult {
        graph: b.finish(),
        status: RunStatus::Failed,
        message: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RunContext {
        RunContext::new("run-guard", "scope-1", "Guarded run")
    }

    #[test]
    fn test_guarded_converts_error_to_failed_run() {
        let result = guarded(&context(), DETERMINISTIC, || anyhow::bail!("index unreadable"));

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.message.as_deref(), Some("index unreadable"));
        let terminal = result.graph.terminal().unwrap();
        assert_eq!(terminal.kind(), EventKind::RunFailed);
        assert!(result.graph.check_contract().is_ok(), "{:?}", result.graph.contract_violations());
    }

    #[test]
    fn test_guarded_converts_panic_to_failed_run() {
        let result = guarded(&context(), DETERMINISTIC, || -> anyhow::Result<RunResult> {
            panic!("scorer blew up")
        });

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.message.unwrap().contains("scorer blew up"));
        assert_eq!(result.graph.count(EventKind::RunFailed), 1);
        assert_eq!(result.graph.outcomes[0].confidence, None);
        assert!(result.graph.outcomes[0].confidence_is_explained());
    }
}
