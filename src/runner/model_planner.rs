//! Model-planner runner
//!
//! No planning model is wired in. The strategy runs the deterministic
//! path and says so in a `reasoning.step` right after `run.started`, so
//! the graph never claims model reasoning that did not happen.

use super::{CandidateIndex, DeterministicRunner, RunResult, Runner, DETERMINISTIC, MODEL_PLANNER};
use crate::graph::*;
use crate::types::RunContext;
use async_trait::async_trait;

/// Stable phrase carried by every fallback note
pub const PLANNER_FALLBACK_PHRASE: &str = "fallback to deterministic execution";

#[derive(Debug, Default, Clone)]
pub struct ModelPlannerRunner {
    delegate: DeterministicRunner,
}

impl ModelPlannerRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Runner for ModelPlannerRunner {
    fn name(&self) -> &str {
        MODEL_PLANNER
    }

    async fn execute(&self, context: &RunContext, index: Option<&CandidateIndex>) -> RunResult {
        let mut result = self.delegate.run_as(context, index, MODEL_PLANNER);

        let note = ReasoningEvent::new(
            &context.run_id,
            "Planner unavailable",
            EventPayload::ReasoningStep(ReasoningNote::PlannerFallback {
                requested: MODEL_PLANNER.to_string(),
                executed: DETERMINISTIC.to_string(),
            }),
        )
        .with_summary(format!(
            "No planning model is configured; {}",
            PLANNER_FALLBACK_PHRASE
        ));

        let position = result
            .graph
            .events
            .iter()
            .position(|e| e.kind() == EventKind::RunStarted)
            .map_or(0, |i| i + 1);
        result.graph.insert_event(position, note);

        tracing::info!(run_id = %context.run_id, "model planner fell back to deterministic execution");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Pointer, VaultRef};

    fn context() -> RunContext {
        RunContext::new("run-planner", "scope-1", "Planned run").with_binding(
            Pointer::parse("/inputs/site").unwrap(),
            VaultRef {
                confidence: Some(0.75),
                ..VaultRef::new("obj-1")
            },
        )
    }

    #[tokio::test]
    async fn test_fallback_note_follows_run_started() {
        let result = ModelPlannerRunner::new().execute(&context(), None).await;
        let events = &result.graph.events;

        assert_eq!(events[0].kind(), EventKind::RunStarted);
        assert_eq!(events[1].kind(), EventKind::ReasoningStep);
        assert!(events[1].summary.as_deref().unwrap().contains(PLANNER_FALLBACK_PHRASE));
        match &events[1].payload {
            EventPayload::ReasoningStep(ReasoningNote::PlannerFallback { requested, executed }) => {
                assert_eq!(requested, MODEL_PLANNER);
                assert_eq!(executed, DETERMINISTIC);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_planner_matches_deterministic_results() {
        let planned = ModelPlannerRunner::new().execute(&context(), None).await;
        let plain = DeterministicRunner::new().execute(&context(), None).await;

        assert_eq!(planned.status, plain.status);
        assert_eq!(planned.graph.events.len(), plain.graph.events.len() + 1);
        assert_eq!(planned.graph.outcomes[0].confidence, plain.graph.outcomes[0].confidence);
        assert_eq!(planned.graph.evidence.len(), plain.graph.evidence.len());

        match &planned.graph.events[0].payload {
            EventPayload::RunStarted { strategy, .. } => assert_eq!(strategy, MODEL_PLANNER),
            other => panic!("unexpected payload {:?}", other),
        }
        let seqs: Vec<u64> = planned.graph.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
        assert!(planned.graph.check_contract().is_ok());
    }
}
