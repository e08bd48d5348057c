//! Multi-agent runner (scaffold)
//!
//! Runs the deterministic path and records which multi-agent capabilities
//! exist only as placeholders, just ahead of the terminal event.

use super::{CandidateIndex, DeterministicRunner, RunResult, Runner, MULTI_AGENT};
use crate::graph::*;
use crate::types::RunContext;
use async_trait::async_trait;

const SCAFFOLD_STATUS: &str = "scaffold";

#[derive(Debug, Default, Clone)]
pub struct MultiAgentRunner {
    delegate: DeterministicRunner,
}

impl MultiAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities the strategy will eventually provide
    pub fn capabilities() -> Vec<Capability> {
        [
            ("sub_agent_calls", "Delegate sub-questions to specialised agents"),
            ("tool_calls", "Invoke external tools and record them as evidence"),
            ("memory_write_backs", "Write conclusions back to the vault"),
        ]
        .into_iter()
        .map(|(name, description)| Capability {
            name: name.to_string(),
            description: description.to_string(),
            implemented: false,
        })
        .collect()
    }
}

#[async_trait]
impl Runner for MultiAgentRunner {
    fn name(&self) -> &str {
        MULTI_AGENT
    }

    async fn execute(&self, context: &RunContext, index: Option<&CandidateIndex>) -> RunResult {
        let mut result = self.delegate.run_as(context, index, MULTI_AGENT);

        let capabilities = Self::capabilities();
        let names: Vec<&str> = capabilities.iter().map(|c| c.name.as_str()).collect();
        let note = ReasoningEvent::new(
            &context.run_id,
            "Multi-agent scaffold",
            EventPayload::ReasoningStep(ReasoningNote::Scaffold {
                status: SCAFFOLD_STATUS.to_string(),
                capabilities: capabilities.clone(),
            }),
        )
        .with_summary(format!(
            "Multi-agent execution is scaffolded; not yet implemented: {}",
            names.join(", ")
        ));

        let events = &result.graph.events;
        let position = match events.last() {
            Some(last) if last.kind().is_terminal() => events.len() - 1,
            _ => events.len(),
        };
        result.graph.insert_event(position, note);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Pointer, VaultRef};

    #[tokio::test]
    async fn test_scaffold_note_precedes_terminal_event() {
        let context = RunContext::new("run-multi", "scope-1", "Delegated run")
            .with_binding(Pointer::parse("/inputs/site").unwrap(), VaultRef::new("obj-1"));

        let result = MultiAgentRunner::new().execute(&context, None).await;
        let events = &result.graph.events;
        let n = events.len();

        assert_eq!(events[n - 1].kind(), EventKind::RunCompleted);
        assert_eq!(events[n - 2].kind(), EventKind::ReasoningStep);
        match &events[n - 2].payload {
            EventPayload::ReasoningStep(ReasoningNote::Scaffold { status, capabilities }) => {
                assert_eq!(status, "scaffold");
                assert_eq!(capabilities.len(), 3);
                assert!(capabilities.iter().all(|c| !c.implemented));
                assert!(capabilities.iter().any(|c| c.name == "memory_write_backs"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(events[n - 1].seq, n as u64);
        assert!(result.graph.check_contract().is_ok(), "{:?}", result.graph.contract_violations());
    }
}
