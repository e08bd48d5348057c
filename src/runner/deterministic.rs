//! Deterministic runner
//!
//! Binds exactly what the caller supplied, one evidence record per binding.
//! When a candidate index is offered the scorer runs too, but only to
//! explain the choice; its suggestions never replace caller bindings.

use super::{guarded, CandidateIndex, RunResult, Runner, BIND_STEP, DETERMINISTIC};
use crate::graph::*;
use crate::scorer::compute_readiness;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Default, Clone)]
pub struct DeterministicRunner;

impl DeterministicRunner {
    pub fn new() -> Self {
        Self
    }

    /// Execute, recording `strategy` as the strategy in `run.started`
    pub(crate) fn run_as(&self, context: &RunContext, index: Option<&CandidateIndex>, strategy: &str) -> RunResult {
        guarded(context, strategy, || build_graph(context, index, strategy))
    }
}

#[async_trait]
impl Runner for DeterministicRunner {
    fn name(&self) -> &str {
        DETERMINISTIC
    }

    async fn execute(&self, context: &RunContext, index: Option<&CandidateIndex>) -> RunResult {
        self.run_as(context, index, DETERMINISTIC)
    }
}

fn build_graph(context: &RunContext, index: Option<&CandidateIndex>, strategy: &str) -> Result<RunResult> {
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
        "Binding inputs",
        None,
        EventPayload::StepStarted { step_id: BIND_STEP.to_string() },
        vec![],
        vec![],
    );

    // Advisory ranking
    let readiness = index.map(|idx| {
        let optional: Vec<Pointer> = context
            .input_bindings
            .keys()
            .filter(|p| !context.required_inputs.contains(p))
            .cloned()
            .collect();
        let readiness = compute_readiness(&context.required_inputs, &optional, &idx.records, &idx.options);

        let mut pointers = context.required_inputs.clone();
        pointers.extend(optional);
        b.emit(
            "Candidates ranked",
            Some(format!(
                "Ranked {} candidate object(s) for {} pointer(s); ranking is advisory",
                readiness.ranked_candidates.len(),
                pointers.len()
            )),
            EventPayload::CandidatesRanked {
                pointers,
                candidates: readiness.ranked_candidates.clone(),
                suggested: readiness.suggested_bindings.clone(),
            },
            vec![],
            vec![],
        );
        readiness
    });

    let mut evidence_ids = Vec::new();
    let mut bound_inputs = Vec::new();
    let mut confidences = Vec::new();

    for (pointer, vault_ref) in &context.input_bindings {
        let mut evidence = EvidenceRecord::from_binding(&context.run_id, pointer, vault_ref);

        if let Some(idx) = index {
            if evidence.confidence.is_none() {
                evidence.confidence = idx
                    .records
                    .iter()
                    .filter(|r| r.object_id == vault_ref.object_id && &r.pointer == pointer)
                    .map(|r| r.confidence)
                    .reduce(f64::max);
            }
            if evidence.relevance.is_none() {
                evidence.relevance = idx
                    .records
                    .iter()
                    .filter(|r| r.object_id == vault_ref.object_id && &r.pointer == pointer)
                    .map(|r| r.relevance)
                    .max();
            }
            evidence.historical_reliability = idx.options.historical.get(&vault_ref.object_id).copied();
        }
        if let Some(readiness) = &readiness {
            evidence.score_snapshot = readiness
                .ranked_candidates
                .iter()
                .find(|c| c.object_id == vault_ref.object_id)
                .cloned();
        }
        if let Some(c) = evidence.confidence {
            confidences.push(c.clamp(0.0, 1.0));
        }

        let evidence_id = b.add_evidence(evidence);
        b.emit(
            format!("Bound {}", pointer),
            vault_ref
                .label
                .as_ref()
                .map(|label| format!("{} -> {}", pointer, label)),
            EventPayload::EvidenceBound {
                pointer: pointer.clone(),
                vault_object_id: vault_ref.object_id.clone(),
            },
            vec![evidence_id.clone()],
            vec![],
        );

        evidence_ids.push(evidence_id);
        bound_inputs.push(BoundInput {
            pointer: pointer.clone(),
            vault_object_id: vault_ref.object_id.clone(),
            label: vault_ref.label.clone(),
            value: vault_ref.value.clone(),
        });
    }

    let missing = context.missing_required();
    b.emit(
        "Binding summary",
        Some(if missing.is_empty() {
            format!("{} input(s) bound; all required inputs present", bound_inputs.len())
        } else {
            format!(
                "{} input(s) bound; missing required: {}",
                bound_inputs.len(),
                join_pointers(&missing)
            )
        }),
        EventPayload::ReasoningStep(ReasoningNote::BindingSummary {
            bound: bound_inputs.len(),
            missing: missing.clone(),
        }),
        evidence_ids.clone(),
        vec![],
    );

    let (outcome, status, message) = if missing.is_empty() {
        let outcome = bindings_outcome(context, bound_inputs, &confidences)?;
        (outcome, RunStatus::Complete, None)
    } else {
        let checklist = missing
            .iter()
            .map(|pointer| MissingInput {
                pointer: pointer.clone(),
                next_actions: next_actions(pointer, readiness.as_ref(), index),
            })
            .collect();
        let outcome = OutcomeRecord::unscored(
            &context.run_id,
            RenderAs::Json,
            format!("{}: missing context", context.title),
            OutcomeResult::MissingContext { missing: checklist },
            format!(
                "Required input(s) {} are not bound, so the result cannot be assessed",
                join_pointers(&missing)
            ),
        );
        let message = format!("Missing required inputs: {}", join_pointers(&missing));
        (outcome, RunStatus::Partial, Some(message))
    };

    let outcome_id = b.add_outcome(outcome.with_evidence(evidence_ids.clone()));
    b.emit(
        "Outcome proposed",
        None,
        EventPayload::OutcomeProposed,
        evidence_ids.clone(),
        vec![outcome_id.clone()],
    );
    b.emit(
        "Outcome finalized",
        None,
        EventPayload::OutcomeFinalized,
        evidence_ids,
        vec![outcome_id],
    );
    b.emit(
        "Inputs bound",
        None,
        EventPayload::StepCompleted { step_id: BIND_STEP.to_string() },
        vec![],
        vec![],
    );
    b.emit(
        "Run completed",
        message.clone(),
        EventPayload::RunCompleted { status },
        vec![],
        vec![],
    );

    tracing::debug!(run_id = %context.run_id, status = status.name(), "deterministic run finished");

    Ok(RunResult {
        graph: b.finish(),
        status,
        message,
    })
}

fn bindings_outcome(context: &RunContext, inputs: Vec<BoundInput>, confidences: &[f64]) -> Result<OutcomeRecord> {
    let headline = format!("{}: {} input(s) bound", context.title, inputs.len());
    let result = OutcomeResult::Bindings { inputs };

    if confidences.is_empty() {
        return Ok(OutcomeRecord::unscored(
            &context.run_id,
            RenderAs::Table,
            headline,
            result,
            "No bound input reported a confidence",
        ));
    }

    let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
    Ok(OutcomeRecord::scored(&context.run_id, RenderAs::Table, headline, result, mean)?)
}

/// Remedies for one unbound required pointer
fn next_actions(pointer: &Pointer, readiness: Option<&ReadinessResult>, index: Option<&CandidateIndex>) -> Vec<String> {
    let mut actions = Vec::new();

    if let (Some(readiness), Some(index)) = (readiness, index) {
        if let Some(binding) = readiness.suggested_bindings.iter().find(|b| &b.pointer == pointer) {
            actions.push(format!(
                "Bind suggested vault object {} (confidence {:.2})",
                binding.object_id, binding.confidence
            ));
        } else if let Some(best) = index
            .records
            .iter()
            .filter(|r| &r.pointer == pointer)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        {
            actions.push(format!(
                "Review vault object {}: confidence {:.2} is below the {:.2} threshold",
                best.object_id, best.confidence, index.options.min_confidence
            ));
        }
    }

    actions.push(format!("Add or accept a vault record that provides {}", pointer.leaf()));
    actions.push(format!("Provide {} manually and rerun", pointer));
    actions
}

fn join_pointers(pointers: &[Pointer]) -> String {
    pointers
        .iter()
        .map(Pointer::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::ReadinessOptions;
    use chrono::{TimeZone, Utc};

    fn ptr(s: &str) -> Pointer {
        Pointer::parse(s).unwrap()
    }

    fn vault_ref(object_id: &str, confidence: f64) -> VaultRef {
        VaultRef {
            confidence: Some(confidence),
            relevance: Some(Relevance::High),
            ..VaultRef::new(object_id)
        }
    }

    fn two_binding_context() -> RunContext {
        RunContext::new("run-det", "scope-1", "Site survey")
            .with_binding(ptr("/inputs/site"), vault_ref("obj-1", 0.9))
            .with_binding(ptr("/inputs/date"), vault_ref("obj-2", 0.7))
            .with_required(vec![ptr("/inputs/site"), ptr("/inputs/date")])
    }

    fn low_confidence_index() -> CandidateIndex {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        CandidateIndex::new(vec![CandidateRecord {
            object_id: "obj-1".into(),
            record_type: "document".into(),
            pointer: ptr("/inputs/site"),
            value: serde_json::json!("Rotterdam"),
            confidence: 0.3,
            relevance: Relevance::High,
            updated_at: now,
            provenance: None,
        }])
        .with_options(ReadinessOptions::at(now))
    }

    #[tokio::test]
    async fn test_two_bindings_complete() {
        let result = DeterministicRunner::new().execute(&two_binding_context(), None).await;
        let graph = &result.graph;

        assert_eq!(result.status, RunStatus::Complete);
        assert!(result.message.is_none());
        assert_eq!(graph.count(EventKind::RunStarted), 1);
        assert_eq!(graph.count(EventKind::RunCompleted), 1);
        assert_eq!(graph.count(EventKind::EvidenceBound), 2);
        assert_eq!(graph.count(EventKind::CandidatesRanked), 0);
        assert_eq!(graph.evidence.len(), 2);
        assert_eq!(graph.outcomes.len(), 1);

        let outcome = &graph.outcomes[0];
        let confidence = outcome.confidence.unwrap();
        assert!((confidence - 0.8).abs() < 1e-9);
        assert_eq!(outcome.evidence_ids.len(), 2);
        assert!(graph.check_contract().is_ok(), "{:?}", graph.contract_violations());
    }

    #[tokio::test]
    async fn test_event_order_follows_contract() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let index = CandidateIndex::new(vec![]).with_options(ReadinessOptions::at(now));
        let result = DeterministicRunner::new()
            .execute(&two_binding_context(), Some(&index))
            .await;

        let kinds: Vec<EventKind> = result.graph.events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::RunStarted,
                EventKind::StepStarted,
                EventKind::CandidatesRanked,
                EventKind::EvidenceBound,
                EventKind::EvidenceBound,
                EventKind::ReasoningStep,
                EventKind::OutcomeProposed,
                EventKind::OutcomeFinalized,
                EventKind::StepCompleted,
                EventKind::RunCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_required_is_partial() {
        let context = RunContext::new("run-partial", "scope-1", "Site survey")
            .with_required(vec![ptr("/inputs/site")]);
        let index = low_confidence_index();

        let result = DeterministicRunner::new().execute(&context, Some(&index)).await;

        assert_eq!(result.status, RunStatus::Partial);
        assert!(result.message.as_deref().unwrap().contains("/inputs/site"));

        let outcome = &result.graph.outcomes[0];
        assert_eq!(outcome.render_as, RenderAs::Json);
        assert_eq!(outcome.confidence, None);
        assert!(outcome.confidence_reason.as_deref().unwrap().contains("/inputs/site"));
        match &outcome.result {
            OutcomeResult::MissingContext { missing } => {
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].pointer, ptr("/inputs/site"));
                assert!(missing[0].next_actions[0].contains("below the 0.60 threshold"));
            }
            other => panic!("unexpected result {:?}", other),
        }

        // Ranking ran but suggested nothing
        let ranked = result.graph.events_of(EventKind::CandidatesRanked).next().unwrap();
        match &ranked.payload {
            EventPayload::CandidatesRanked { candidates, suggested, .. } => {
                assert_eq!(candidates.len(), 1);
                assert!(suggested.is_empty());
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(result.graph.check_contract().is_ok());
    }

    #[tokio::test]
    async fn test_ranking_never_overrides_caller_binding() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let record = |object_id: &str, confidence| CandidateRecord {
            object_id: object_id.into(),
            record_type: "document".into(),
            pointer: ptr("/inputs/site"),
            value: serde_json::Value::Null,
            confidence,
            relevance: Relevance::High,
            updated_at: now,
            provenance: None,
        };
        let index = CandidateIndex::new(vec![record("obj-better", 0.99), record("obj-chosen", 0.65)])
            .with_options(ReadinessOptions::at(now));
        let context = RunContext::new("run-advisory", "scope-1", "Site")
            .with_binding(ptr("/inputs/site"), VaultRef::new("obj-chosen"))
            .with_required(vec![ptr("/inputs/site")]);

        let result = DeterministicRunner::new().execute(&context, Some(&index)).await;

        assert_eq!(result.status, RunStatus::Complete);
        let evidence = &result.graph.evidence[0];
        assert_eq!(evidence.vault_object_id.as_deref(), Some("obj-chosen"));
        // Confidence and snapshot come from the index entry of the bound object
        assert_eq!(evidence.confidence, Some(0.65));
        assert_eq!(evidence.score_snapshot.as_ref().unwrap().object_id, "obj-chosen");
        assert!(!evidence.score_snapshot.as_ref().unwrap().selected);
    }

    #[tokio::test]
    async fn test_bindings_without_confidence_are_unscored() {
        let context = RunContext::new("run-unscored", "scope-1", "Notes")
            .with_binding(ptr("/inputs/notes"), VaultRef::new("obj-9"));

        let result = DeterministicRunner::new().execute(&context, None).await;

        assert_eq!(result.status, RunStatus::Complete);
        let outcome = &result.graph.outcomes[0];
        assert_eq!(outcome.confidence, None);
        assert_eq!(
            outcome.confidence_reason.as_deref(),
            Some("No bound input reported a confidence")
        );
    }
}
