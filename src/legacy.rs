//! Legacy lifecycle ledger adapter
//!
//! Older runs were logged as flat lifecycle entries (`run_started`,
//! `step_finished`, `artifact_emitted`, ...) with a different shape per
//! type. [`extract_graph`] lifts such a ledger into a [`ReasoningGraph`];
//! [`to_legacy_log`] goes the other way for the kinds the old ledger knew.
//!
//! Ids are taken from the ledger when present and derived from the entry
//! position otherwise, so extracting the same ledger twice yields the same
//! ids and merging deduplicates cleanly.

use crate::graph::*;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RUN_STARTED: &str = "run_started";
pub const RUN_FINISHED: &str = "run_finished";
pub const STEP_STARTED: &str = "step_started";
pub const STEP_FINISHED: &str = "step_finished";
pub const ARTIFACT_EMITTED: &str = "artifact_emitted";

/// Step id used when bound inputs are not enclosed by any step
const UNSCOPED_STEP: &str = "bindings";

/// One raw ledger entry; type-specific fields stay in `fields`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegacyEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub run_id: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LegacyRunStarted {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    scope_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyRunFinished {
    status: RunStatus,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyStepStarted {
    step_id: String,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum LegacyStepStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyInput {
    pointer: Pointer,
    object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    evidence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relevance: Option<Relevance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyStepFinished {
    step_id: String,
    status: LegacyStepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    inputs: Vec<LegacyInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outcome_id: Option<String>,
    headline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    render_as: Option<RenderAs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confidence_reason: Option<String>,
    #[serde(default)]
    evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outcome: Option<LegacyOutcome>,
}

fn parse_fields<T: DeserializeOwned>(fields: &Map<String, Value>) -> Option<T> {
    serde_json::from_value(Value::Object(fields.clone())).ok()
}

fn to_fields<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Events of one extraction, tracking seq and derived ids
struct Extraction {
    builder: GraphBuilder,
}

impl Extraction {
    fn push(
        &mut self,
        event_id: String,
        ts: DateTime<Utc>,
        title: impl Into<String>,
        payload: EventPayload,
        evidence_ids: Vec<String>,
        outcome_ids: Vec<String>,
    ) {
        self.builder.emit(title, None, payload, evidence_ids, outcome_ids);
        let graph = self.builder.graph_mut();
        if let Some(event) = graph.events.last_mut() {
            event.event_id = event_id;
            event.ts = ts;
        }
    }
}

/// Lift a legacy lifecycle ledger into the graph model
///
/// Entries for other runs are ignored; unknown or unparseable entries
/// become a generic `reasoning.step` titled with their type.
pub fn extract_graph(run_id: &str, legacy_events: &[LegacyEvent]) -> ReasoningGraph {
    let mut x = Extraction {
        builder: GraphBuilder::new(run_id),
    };

    for (position, legacy) in legacy_events.iter().enumerate() {
        if legacy.run_id != run_id {
            continue;
        }
        let id = legacy
            .id
            .clone()
            .unwrap_or_else(|| format!("legacy-{}-{}", run_id, position));

        match legacy.event_type.as_str() {
            RUN_STARTED => match parse_fields::<LegacyRunStarted>(&legacy.fields) {
                Some(run) => x.push(
                    id,
                    legacy.ts,
                    run.title.unwrap_or_else(|| "Run started".to_string()),
                    EventPayload::RunStarted {
                        strategy: run.strategy.unwrap_or_else(|| "legacy".to_string()),
                        scope_id: run.scope_id.unwrap_or_default(),
                        input_count: 0,
                    },
                    vec![],
                    vec![],
                ),
                None => push_generic(&mut x, id, legacy),
            },
            RUN_FINISHED => match parse_fields::<LegacyRunFinished>(&legacy.fields) {
                Some(LegacyRunFinished { status: RunStatus::Failed, error }) => x.push(
                    id,
                    legacy.ts,
                    "Run failed",
                    EventPayload::RunFailed {
                        error: error.unwrap_or_else(|| "unknown error".to_string()),
                    },
                    vec![],
                    vec![],
                ),
                Some(finished) => x.push(
                    id,
                    legacy.ts,
                    "Run completed",
                    EventPayload::RunCompleted { status: finished.status },
                    vec![],
                    vec![],
                ),
                None => push_generic(&mut x, id, legacy),
            },
            STEP_STARTED => match parse_fields::<LegacyStepStarted>(&legacy.fields) {
                Some(step) => x.push(
                    id,
                    legacy.ts,
                    step.label.unwrap_or_else(|| format!("Step {}", step.step_id)),
                    EventPayload::StepStarted { step_id: step.step_id },
                    vec![],
                    vec![],
                ),
                None => push_generic(&mut x, id, legacy),
            },
            STEP_FINISHED => match parse_fields::<LegacyStepFinished>(&legacy.fields) {
                Some(step) => extract_step_finished(&mut x, run_id, id, legacy.ts, step),
                None => push_generic(&mut x, id, legacy),
            },
            ARTIFACT_EMITTED => match parse_fields::<LegacyArtifact>(&legacy.fields) {
                Some(artifact) if artifact.artifact.is_some() || artifact.outcome.is_some() => {
                    extract_artifact(&mut x, run_id, id, legacy.ts, artifact)
                }
                _ => push_generic(&mut x, id, legacy),
            },
            _ => push_generic(&mut x, id, legacy),
        }
    }

    x.builder.finish()
}

fn push_generic(x: &mut Extraction, id: String, legacy: &LegacyEvent) {
    x.push(
        id,
        legacy.ts,
        legacy.event_type.clone(),
        EventPayload::ReasoningStep(ReasoningNote::Legacy {
            source_type: legacy.event_type.clone(),
            fields: Value::Object(legacy.fields.clone()),
        }),
        vec![],
        vec![],
    );
}

fn extract_step_finished(
    x: &mut Extraction,
    run_id: &str,
    id: String,
    ts: DateTime<Utc>,
    step: LegacyStepFinished,
) {
    for (i, input) in step.inputs.iter().enumerate() {
        let evidence_id = input
            .evidence_id
            .clone()
            .unwrap_or_else(|| format!("{}-ev-{}", id, i));
        let event_id = input
            .event_id
            .clone()
            .unwrap_or_else(|| format!("{}-bound-{}", id, i));

        x.builder.add_evidence(EvidenceRecord {
            evidence_id: evidence_id.clone(),
            run_id: run_id.to_string(),
            ts,
            kind: EvidenceKind::VaultObject,
            vault_object_id: Some(input.object_id.clone()),
            pointer: Some(input.pointer.clone()),
            provenance: None,
            confidence: input.confidence,
            relevance: input.relevance,
            score_snapshot: None,
            historical_reliability: None,
        });
        x.push(
            event_id,
            ts,
            format!("Bound {}", input.pointer),
            EventPayload::EvidenceBound {
                pointer: input.pointer.clone(),
                vault_object_id: input.object_id.clone(),
            },
            vec![evidence_id],
            vec![],
        );
    }

    let payload = match step.status {
        LegacyStepStatus::Completed => EventPayload::StepCompleted { step_id: step.step_id.clone() },
        LegacyStepStatus::Failed => EventPayload::StepFailed {
            step_id: step.step_id.clone(),
            error: step.error.unwrap_or_else(|| "unknown error".to_string()),
        },
    };
    x.push(id, ts, format!("Step {} finished", step.step_id), payload, vec![], vec![]);
}

fn extract_artifact(
    x: &mut Extraction,
    run_id: &str,
    id: String,
    ts: DateTime<Utc>,
    artifact: LegacyArtifact,
) {
    let Some(legacy_outcome) = artifact.outcome else {
        if let Some(artifact_ref) = artifact.artifact {
            let title = artifact_ref.title.clone();
            x.push(id, ts, title, EventPayload::ArtifactEmitted(artifact_ref), vec![], vec![]);
        }
        return;
    };

    let outcome_id = legacy_outcome
        .outcome_id
        .clone()
        .unwrap_or_else(|| format!("{}-outcome", id));
    let result = match legacy_outcome.result {
        Some(value) => serde_json::from_value::<OutcomeResult>(value.clone())
            .unwrap_or(OutcomeResult::Value { value }),
        None => OutcomeResult::Value { value: Value::Null },
    };
    let (confidence, confidence_reason) = match legacy_outcome.confidence {
        Some(c) if (0.0..=1.0).contains(&c) => (Some(c), legacy_outcome.confidence_reason),
        Some(c) => (None, Some(format!("legacy confidence {} is outside [0, 1]", c))),
        None => (
            None,
            Some(
                legacy_outcome
                    .confidence_reason
                    .unwrap_or_else(|| "legacy artifact did not record a confidence".to_string()),
            ),
        ),
    };

    x.builder.add_outcome(OutcomeRecord {
        outcome_id: outcome_id.clone(),
        run_id: run_id.to_string(),
        ts,
        render_as: legacy_outcome.render_as.unwrap_or(RenderAs::Text),
        headline: legacy_outcome.headline.clone(),
        result,
        confidence,
        confidence_reason,
        evidence_ids: legacy_outcome.evidence_ids.clone(),
        artifact: artifact.artifact.clone(),
    });

    if let Some(artifact_ref) = artifact.artifact {
        let title = artifact_ref.title.clone();
        x.push(
            format!("{}-artifact", id),
            ts,
            title,
            EventPayload::ArtifactEmitted(artifact_ref),
            vec![],
            vec![outcome_id.clone()],
        );
    }
    x.push(
        id,
        ts,
        legacy_outcome.headline,
        EventPayload::OutcomeFinalized,
        legacy_outcome.evidence_ids,
        vec![outcome_id],
    );
}

/// Render a graph as a legacy lifecycle ledger
///
/// Only the kinds the old ledger could express are written: run and step
/// boundaries, bound inputs (inside their step) and finalized outcomes.
pub fn to_legacy_log(graph: &ReasoningGraph) -> Vec<LegacyEvent> {
    let mut log = Vec::new();
    let mut pending_inputs: Vec<LegacyInput> = Vec::new();
    let entry = |event_type: &str, event: &ReasoningEvent, fields: Map<String, Value>| LegacyEvent {
        event_type: event_type.to_string(),
        id: Some(event.event_id.clone()),
        run_id: graph.run_id.clone(),
        ts: event.ts,
        fields,
    };

    for event in &graph.events {
        match &event.payload {
            EventPayload::RunStarted { strategy, scope_id, .. } => {
                let fields = to_fields(&LegacyRunStarted {
                    title: Some(event.title.clone()),
                    strategy: Some(strategy.clone()),
                    scope_id: Some(scope_id.clone()),
                });
                log.push(entry(RUN_STARTED, event, fields));
            }
            EventPayload::StepStarted { step_id } => {
                let fields = to_fields(&LegacyStepStarted {
                    step_id: step_id.clone(),
                    label: Some(event.title.clone()),
                });
                log.push(entry(STEP_STARTED, event, fields));
            }
            EventPayload::EvidenceBound { pointer, vault_object_id } => {
                let evidence = event
                    .evidence_ids
                    .first()
                    .and_then(|id| graph.evidence_by_id(id));
                pending_inputs.push(LegacyInput {
                    pointer: pointer.clone(),
                    object_id: vault_object_id.clone(),
                    evidence_id: evidence.map(|e| e.evidence_id.clone()),
                    event_id: Some(event.event_id.clone()),
                    confidence: evidence.and_then(|e| e.confidence),
                    relevance: evidence.and_then(|e| e.relevance),
                });
            }
            EventPayload::StepCompleted { step_id } | EventPayload::StepFailed { step_id, .. } => {
                let (status, error) = match &event.payload {
                    EventPayload::StepFailed { error, .. } => (LegacyStepStatus::Failed, Some(error.clone())),
                    _ => (LegacyStepStatus::Completed, None),
                };
                let fields = to_fields(&LegacyStepFinished {
                    step_id: step_id.clone(),
                    status,
                    error,
                    inputs: std::mem::take(&mut pending_inputs),
                });
                log.push(entry(STEP_FINISHED, event, fields));
            }
            EventPayload::OutcomeFinalized => {
                for outcome_id in &event.outcome_ids {
                    let Some(outcome) = graph.outcomes.iter().find(|o| &o.outcome_id == outcome_id) else {
                        continue;
                    };
                    let fields = to_fields(&LegacyArtifact {
                        artifact: outcome.artifact.clone(),
                        outcome: Some(LegacyOutcome {
                            outcome_id: Some(outcome.outcome_id.clone()),
                            headline: outcome.headline.clone(),
                            render_as: Some(outcome.render_as),
                            result: serde_json::to_value(&outcome.result).ok(),
                            confidence: outcome.confidence,
                            confidence_reason: outcome.confidence_reason.clone(),
                            evidence_ids: outcome.evidence_ids.clone(),
                        }),
                    });
                    log.push(entry(ARTIFACT_EMITTED, event, fields));
                }
            }
            EventPayload::ArtifactEmitted(artifact) => {
                let fields = to_fields(&LegacyArtifact {
                    artifact: Some(artifact.clone()),
                    outcome: None,
                });
                log.push(entry(ARTIFACT_EMITTED, event, fields));
            }
            EventPayload::RunCompleted { .. } | EventPayload::RunFailed { .. } => {
                if !pending_inputs.is_empty() {
                    let fields = to_fields(&LegacyStepFinished {
                        step_id: UNSCOPED_STEP.to_string(),
                        status: LegacyStepStatus::Completed,
                        error: None,
                        inputs: std::mem::take(&mut pending_inputs),
                    });
                    log.push(LegacyEvent {
                        id: Some(format!("{}-{}", event.event_id, UNSCOPED_STEP)),
                        ..entry(STEP_FINISHED, event, fields)
                    });
                }
                let finished = match &event.payload {
                    EventPayload::RunFailed { error } => LegacyRunFinished {
                        status: RunStatus::Failed,
                        error: Some(error.clone()),
                    },
                    EventPayload::RunCompleted { status } => LegacyRunFinished { status: *status, error: None },
                    _ => continue,
                };
                let fields = to_fields(&finished);
                log.push(entry(RUN_FINISHED, event, fields));
            }
            // The old ledger had no counterpart for these
            EventPayload::CandidatesRanked { .. }
            | EventPayload::ReasoningStep(_)
            | EventPayload::OutcomeProposed
            | EventPayload::ActionRequested { .. }
            | EventPayload::ActionCompleted { .. }
            | EventPayload::VaultMutated { .. } => {}
        }
    }

    log
}
