//! Reasoning Graph - the explanation of one run
//!
//! Events say what happened, evidence says what it was based on, outcomes
//! say what came out. A graph is built once by a runner through
//! [`GraphBuilder`] and is not mutated after it is returned.
//!
//! Every event carries a per-run `seq` so the causal order survives
//! merging and persistence.

use crate::error::SpineError;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// The closed set of event kinds, without payloads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "evidence.candidates_ranked")]
    CandidatesRanked,
    #[serde(rename = "evidence.bound")]
    EvidenceBound,
    #[serde(rename = "reasoning.step")]
    ReasoningStep,
    #[serde(rename = "outcome.proposed")]
    OutcomeProposed,
    #[serde(rename = "outcome.finalized")]
    OutcomeFinalized,
    #[serde(rename = "artifact.emitted")]
    ArtifactEmitted,
    #[serde(rename = "action.requested")]
    ActionRequested,
    #[serde(rename = "action.completed")]
    ActionCompleted,
    #[serde(rename = "vault.mutated")]
    VaultMutated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStarted => "run.started",
            EventKind::RunCompleted => "run.completed",
            EventKind::RunFailed => "run.failed",
            EventKind::StepStarted => "step.started",
            EventKind::StepCompleted => "step.completed",
            EventKind::StepFailed => "step.failed",
            EventKind::CandidatesRanked => "evidence.candidates_ranked",
            EventKind::EvidenceBound => "evidence.bound",
            EventKind::ReasoningStep => "reasoning.step",
            EventKind::OutcomeProposed => "outcome.proposed",
            EventKind::OutcomeFinalized => "outcome.finalized",
            EventKind::ArtifactEmitted => "artifact.emitted",
            EventKind::ActionRequested => "action.requested",
            EventKind::ActionCompleted => "action.completed",
            EventKind::VaultMutated => "vault.mutated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::RunCompleted | EventKind::RunFailed)
    }
}

/// Final status of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Complete,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// A capability a strategy describes but does not provide yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub implemented: bool,
}

/// Structured content of a `reasoning.step` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "note", rename_all = "snake_case")]
pub enum ReasoningNote {
    /// Deterministic summary of what was bound
    BindingSummary { bound: usize, missing: Vec<Pointer> },
    /// A planner strategy was asked for but not available
    PlannerFallback { requested: String, executed: String },
    /// Scaffolded strategy status
    Scaffold { status: String, capabilities: Vec<Capability> },
    /// A legacy ledger entry with no structured counterpart
    Legacy { source_type: String, fields: serde_json::Value },
}

/// What changed about a vault object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum VaultChange {
    /// Learning loop aggregate for one object in one run
    UsageRecorded { average_contribution: f64, entry_count: usize },
    /// Human review decision
    Reviewed {
        action: ReviewAction,
        updates: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Accepted,
    Blocked,
}

/// Reference to something a run produced outside the graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    pub artifact_id: String,
    pub kind: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Kind-specific payload of an event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data")]
pub enum EventPayload {
    #[serde(rename = "run.started")]
    RunStarted { strategy: String, scope_id: String, input_count: usize },
    #[serde(rename = "run.completed")]
    RunCompleted { status: RunStatus },
    #[serde(rename = "run.failed")]
    RunFailed { error: String },
    #[serde(rename = "step.started")]
    StepStarted { step_id: String },
    #[serde(rename = "step.completed")]
    StepCompleted { step_id: String },
    #[serde(rename = "step.failed")]
    StepFailed { step_id: String, error: String },
    #[serde(rename = "evidence.candidates_ranked")]
    CandidatesRanked {
        pointers: Vec<Pointer>,
        candidates: Vec<CandidateScoreBreakdown>,
        suggested: Vec<SuggestedBinding>,
    },
    #[serde(rename = "evidence.bound")]
    EvidenceBound { pointer: Pointer, vault_object_id: String },
    #[serde(rename = "reasoning.step")]
    ReasoningStep(ReasoningNote),
    #[serde(rename = "outcome.proposed")]
    OutcomeProposed,
    #[serde(rename = "outcome.finalized")]
    OutcomeFinalized,
    #[serde(rename = "artifact.emitted")]
    ArtifactEmitted(ArtifactRef),
    #[serde(rename = "action.requested")]
    ActionRequested { action: String, payload: serde_json::Value },
    #[serde(rename = "action.completed")]
    ActionCompleted { action: String, result: serde_json::Value },
    #[serde(rename = "vault.mutated")]
    VaultMutated {
        vault_object_id: String,
        #[serde(flatten)]
        change: VaultChange,
        persisted: bool,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::RunStarted { .. } => EventKind::RunStarted,
            EventPayload::RunCompleted { .. } => EventKind::RunCompleted,
            EventPayload::RunFailed { .. } => EventKind::RunFailed,
            EventPayload::StepStarted { .. } => EventKind::StepStarted,
            EventPayload::StepCompleted { .. } => EventKind::StepCompleted,
            EventPayload::StepFailed { .. } => EventKind::StepFailed,
            EventPayload::CandidatesRanked { .. } => EventKind::CandidatesRanked,
            EventPayload::EvidenceBound { .. } => EventKind::EvidenceBound,
            EventPayload::ReasoningStep(_) => EventKind::ReasoningStep,
            EventPayload::OutcomeProposed => EventKind::OutcomeProposed,
            EventPayload::OutcomeFinalized => EventKind::OutcomeFinalized,
            EventPayload::ArtifactEmitted(_) => EventKind::ArtifactEmitted,
            EventPayload::ActionRequested { .. } => EventKind::ActionRequested,
            EventPayload::ActionCompleted { .. } => EventKind::ActionCompleted,
            EventPayload::VaultMutated { .. } => EventKind::VaultMutated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningEvent {
    pub event_id: String,
    pub run_id: String,
    /// Position in the run's causal order, starting at 1
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    #[serde(default)]
    pub outcome_ids: Vec<String>,
}

impl ReasoningEvent {
    /// A detached event (not yet placed in a run's sequence)
    pub fn new(run_id: &str, title: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: new_id("evt"),
            run_id: run_id.to_string(),
            seq: 0,
            ts: Utc::now(),
            title: title.into(),
            summary: None,
            payload,
            evidence_ids: Vec::new(),
            outcome_ids: Vec::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvidenceKind {
    #[serde(rename = "vault.object")]
    VaultObject,
    #[serde(rename = "vault.extract")]
    VaultExtract,
    #[serde(rename = "policy.citation")]
    PolicyCitation,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "user.input")]
    UserInput,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceRecord {
    pub evidence_id: String,
    pub run_id: String,
    pub ts: DateTime<Utc>,
    pub kind: EvidenceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<Pointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ProvenanceSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<Relevance>,
    /// Score breakdown captured when the evidence was bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_snapshot: Option<CandidateScoreBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_reliability: Option<f64>,
}

impl EvidenceRecord {
    /// Evidence for a caller-bound vault object
    pub fn from_binding(run_id: &str, pointer: &Pointer, vault_ref: &VaultRef) -> Self {
        Self {
            evidence_id: new_id("ev"),
            run_id: run_id.to_string(),
            ts: Utc::now(),
            kind: EvidenceKind::VaultObject,
            vault_object_id: Some(vault_ref.object_id.clone()),
            pointer: Some(pointer.clone()),
            provenance: vault_ref.provenance.clone(),
            confidence: vault_ref.confidence,
            relevance: vault_ref.relevance,
            score_snapshot: None,
            historical_reliability: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RenderAs {
    Badge,
    Enum,
    Score,
    Currency,
    Text,
    Json,
    Table,
}

/// A required pointer with nothing bound to it, and what to do about it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissingInput {
    pub pointer: Pointer,
    pub next_actions: Vec<String>,
}

/// One bound input as shown in a run summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoundInput {
    pub pointer: Pointer,
    pub vault_object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Result payload of an outcome
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutcomeResult {
    Bindings { inputs: Vec<BoundInput> },
    MissingContext { missing: Vec<MissingInput> },
    Failure { error: String },
    Value { value: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    pub outcome_id: String,
    pub run_id: String,
    pub ts: DateTime<Utc>,
    pub render_as: RenderAs,
    pub headline: String,
    pub result: OutcomeResult,
    /// `None` only together with `confidence_reason`
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_reason: Option<String>,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
}

impl OutcomeRecord {
    /// Outcome with a numeric confidence
    pub fn scored(
        run_id: &str,
        render_as: RenderAs,
        headline: impl Into<String>,
        result: OutcomeResult,
        confidence: f64,
    ) -> Result<Self, SpineError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(SpineError::InvalidConfidence(confidence));
        }
        Ok(Self::build(run_id, render_as, headline.into(), result, Some(confidence), None))
    }

    /// Outcome whose confidence cannot be stated; the reason is mandatory
    pub fn unscored(
        run_id: &str,
        render_as: RenderAs,
        headline: impl Into<String>,
        result: OutcomeResult,
        reason: impl Into<String>,
    ) -> Self {
        Self::build(run_id, render_as, headline.into(), result, None, Some(reason.into()))
    }

    fn build(
        run_id: &str,
        render_as: RenderAs,
        headline: String,
        result: OutcomeResult,
        confidence: Option<f64>,
        confidence_reason: Option<String>,
    ) -> Self {
        Self {
            outcome_id: new_id("out"),
            run_id: run_id.to_string(),
            ts: Utc::now(),
            render_as,
            headline,
            result,
            confidence,
            confidence_reason,
            evidence_ids: Vec::new(),
            artifact: None,
        }
    }

    pub fn with_evidence(mut self, evidence_ids: Vec<String>) -> Self {
        self.evidence_ids = evidence_ids;
        self
    }

    /// Confidence is a number in [0, 1], or absent with a reason
    pub fn confidence_is_explained(&self) -> bool {
        match self.confidence {
            Some(c) => (0.0..=1.0).contains(&c),
            None => self
                .confidence_reason
                .as_deref()
                .is_some_and(|r| !r.trim().is_empty()),
        }
    }
}

/// The finished explanation of one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningGraph {
    pub run_id: String,
    pub events: Vec<ReasoningEvent>,
    pub evidence: Vec<EvidenceRecord>,
    pub outcomes: Vec<OutcomeRecord>,
}

impl ReasoningGraph {
    pub fn empty(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            events: Vec::new(),
            evidence: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|e| e.kind() == kind).count()
    }

    pub fn events_of(&self, kind: EventKind) -> impl Iterator<Item = &ReasoningEvent> {
        self.events.iter().filter(move |e| e.kind() == kind)
    }

    pub fn terminal(&self) -> Option<&ReasoningEvent> {
        self.events.last().filter(|e| e.kind().is_terminal())
    }

    pub fn evidence_by_id(&self, evidence_id: &str) -> Option<&EvidenceRecord> {
        self.evidence.iter().find(|e| e.evidence_id == evidence_id)
    }

    /// Renumber `seq` from 1 in current order
    pub fn resequence(&mut self) {
        for (i, event) in self.events.iter_mut().enumerate() {
            event.seq = i as u64 + 1;
        }
    }

    /// Insert an event at `position` and renumber
    pub fn insert_event(&mut self, position: usize, mut event: ReasoningEvent) {
        event.run_id = self.run_id.clone();
        let position = position.min(self.events.len());
        self.events.insert(position, event);
        self.resequence();
    }

    /// Check the run-level invariants, returning every violation found
    pub fn contract_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        match self.events.first() {
            Some(e) if e.kind() == EventKind::RunStarted => {}
            _ => violations.push("first event is not run.started".to_string()),
        }
        if self.terminal().is_none() {
            violations.push("last event is not run.completed or run.failed".to_string());
        }
        if self.count(EventKind::OutcomeFinalized) == 0 {
            violations.push("no outcome.finalized event".to_string());
        }

        for pair in self.events.windows(2) {
            if pair[1].seq <= pair[0].seq {
                violations.push(format!(
                    "seq not increasing at {} ({} after {})",
                    pair[1].event_id, pair[1].seq, pair[0].seq
                ));
            }
        }

        for event in &self.events {
            if event.run_id != self.run_id {
                violations.push(format!("event {} belongs to run {}", event.event_id, event.run_id));
            }
        }

        let bound_evidence: HashSet<&str> = self
            .events_of(EventKind::EvidenceBound)
            .flat_map(|e| e.evidence_ids.iter().map(String::as_str))
            .collect();
        for evidence in self.evidence.iter().filter(|e| e.kind == EvidenceKind::VaultObject) {
            if !bound_evidence.contains(evidence.evidence_id.as_str()) {
                violations.push(format!("evidence {} has no evidence.bound event", evidence.evidence_id));
            }
        }

        for outcome in &self.outcomes {
            if !outcome.confidence_is_explained() {
                violations.push(format!(
                    "outcome {} has no usable confidence or confidence_reason",
                    outcome.outcome_id
                ));
            }
        }

        violations
    }

    pub fn check_contract(&self) -> Result<(), SpineError> {
        let violations = self.contract_violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SpineError::ContractViolation {
                run_id: self.run_id.clone(),
                detail: violations.join("; "),
            })
        }
    }
}

/// Appends events in causal order, assigning `seq` as it goes
pub struct GraphBuilder {
    graph: ReasoningGraph,
    next_seq: u64,
}

impl GraphBuilder {
    pub fn new(run_id: &str) -> Self {
        Self {
            graph: ReasoningGraph::empty(run_id),
            next_seq: 1,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.graph.run_id
    }

    /// Append an event and return its id
    pub fn emit(
        &mut self,
        title: impl Into<String>,
        summary: Option<String>,
        payload: EventPayload,
        evidence_ids: Vec<String>,
        outcome_ids: Vec<String>,
    ) -> String {
        let mut event = ReasoningEvent::new(&self.graph.run_id, title, payload);
        event.seq = self.next_seq;
        event.summary = summary;
        event.evidence_ids = evidence_ids;
        event.outcome_ids = outcome_ids;
        self.next_seq += 1;

        let id = event.event_id.clone();
        self.graph.events.push(event);
        id
    }

    pub fn add_evidence(&mut self, evidence: EvidenceRecord) -> String {
        let id = evidence.evidence_id.clone();
        self.graph.evidence.push(evidence);
        id
    }

    pub fn add_outcome(&mut self, outcome: OutcomeRecord) -> String {
        let id = outcome.outcome_id.clone();
        self.graph.outcomes.push(outcome);
        id
    }

    pub(crate) fn graph_mut(&mut self) -> &mut ReasoningGraph {
        &mut self.graph
    }

    pub fn finish(self) -> ReasoningGraph {
        self.graph
    }
}

/// Combine two graphs of the same run, primary wins on id conflicts
///
/// Events keep the primary's relative order; secondary-only events are
/// slotted in by timestamp and the result is renumbered. The terminal
/// event always stays last: the primary's if it has one, otherwise the
/// secondary's. A second terminal event is dropped.
pub fn merge_graphs(primary: &ReasoningGraph, secondary: &ReasoningGraph) -> ReasoningGraph {
    let event_ids: HashSet<&str> = primary.events.iter().map(|e| e.event_id.as_str()).collect();
    let evidence_ids: HashSet<&str> = primary.evidence.iter().map(|e| e.evidence_id.as_str()).collect();
    let outcome_ids: HashSet<&str> = primary.outcomes.iter().map(|o| o.outcome_id.as_str()).collect();

    let mut ours: Vec<&ReasoningEvent> = primary.events.iter().collect();
    ours.sort_by_key(|e| e.seq);

    let mut seen_secondary: HashSet<&str> = HashSet::new();
    let mut theirs: Vec<&ReasoningEvent> = secondary
        .events
        .iter()
        .filter(|e| !event_ids.contains(e.event_id.as_str()) && seen_secondary.insert(&e.event_id))
        .collect();
    theirs.sort_by_key(|e| e.seq);

    let terminal = take_terminal(&mut ours).or_else(|| take_terminal(&mut theirs));
    theirs.retain(|e| !e.kind().is_terminal());

    // Two-way merge by timestamp; primary goes first on ties
    let mut events = Vec::with_capacity(ours.len() + theirs.len());
    let (mut i, mut j) = (0, 0);
    while i < ours.len() || j < theirs.len() {
        let take_theirs = match (ours.get(i), theirs.get(j)) {
            (Some(a), Some(b)) => b.ts < a.ts,
            (None, Some(_)) => true,
            _ => false,
        };
        if take_theirs {
            events.push(theirs[j]);
            j += 1;
        } else {
            events.push(ours[i]);
            i += 1;
        }
    }
    events.extend(terminal);

    let mut merged = ReasoningGraph::empty(&primary.run_id);
    merged.events = events
        .into_iter()
        .map(|e| {
            let mut e = e.clone();
            e.run_id = primary.run_id.clone();
            e
        })
        .collect();
    merged.resequence();

    merged.evidence = primary.evidence.clone();
    let mut seen: HashSet<String> = evidence_ids.iter().map(|s| s.to_string()).collect();
    for evidence in &secondary.evidence {
        if seen.insert(evidence.evidence_id.clone()) {
            merged.evidence.push(evidence.clone());
        }
    }

    merged.outcomes = primary.outcomes.clone();
    let mut seen: HashSet<String> = outcome_ids.iter().map(|s| s.to_string()).collect();
    for outcome in &secondary.outcomes {
        if seen.insert(outcome.outcome_id.clone()) {
            merged.outcomes.push(outcome.clone());
        }
    }

    merged
}

/// Remove and return the first terminal event, if any
fn take_terminal<'a>(events: &mut Vec<&'a ReasoningEvent>) -> Option<&'a ReasoningEvent> {
    let position = events.iter().position(|e| e.kind().is_terminal())?;
    Some(events.remove(position))
}

pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn minimal_graph(run_id: &str) -> ReasoningGraph {
        let mut b = GraphBuilder::new(run_id);
        b.emit(
            "Run started",
            None,
            EventPayload::RunStarted {
                strategy: "deterministic".into(),
                scope_id: "scope".into(),
                input_count: 0,
            },
            vec![],
            vec![],
        );
        let outcome = OutcomeRecord::scored(
            run_id,
            RenderAs::Text,
            "Done",
            OutcomeResult::Value { value: serde_json::json!("ok") },
            0.8,
        )
        .unwrap();
        let outcome_id = b.add_outcome(outcome);
        b.emit("Outcome finalized", None, EventPayload::OutcomeFinalized, vec![], vec![outcome_id]);
        b.emit(
            "Run completed",
            None,
            EventPayload::RunCompleted { status: RunStatus::Complete },
            vec![],
            vec![],
        );
        b.finish()
    }

    #[test]
    fn test_builder_assigns_increasing_seq() {
        let graph = minimal_graph("run-1");
        let seqs: Vec<u64> = graph.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(graph.check_contract().is_ok());
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let graph = minimal_graph("run-1");
        let json = serde_json::to_value(&graph.events[0]).unwrap();
        assert_eq!(json["kind"], "run.started");
        assert_eq!(json["data"]["strategy"], "deterministic");

        let back: ReasoningEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, graph.events[0]);
    }

    #[test]
    fn test_vault_mutated_payload_shape() {
        let event = ReasoningEvent::new(
            "run-1",
            "Vault object used",
            EventPayload::VaultMutated {
                vault_object_id: "obj-1".into(),
                change: VaultChange::UsageRecorded { average_contribution: 0.5, entry_count: 2 },
                persisted: false,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "vault.mutated");
        assert_eq!(json["data"]["change"], "usage_recorded");
        assert_eq!(json["data"]["entry_count"], 2);
    }

    #[test]
    fn test_unscored_outcome_requires_reason() {
        let outcome = OutcomeRecord::unscored(
            "run-1",
            RenderAs::Json,
            "Missing inputs",
            OutcomeResult::MissingContext { missing: vec![] },
            "inputs missing",
        );
        assert!(outcome.confidence_is_explained());

        let mut broken = outcome.clone();
        broken.confidence_reason = None;
        assert!(!broken.confidence_is_explained());
    }

    #[test]
    fn test_scored_outcome_rejects_out_of_range() {
        let result = OutcomeRecord::scored(
            "run-1",
            RenderAs::Score,
            "Score",
            OutcomeResult::Value { value: serde_json::json!(1) },
            1.2,
        );
        assert_eq!(result.unwrap_err(), SpineError::InvalidConfidence(1.2));
    }

    #[test]
    fn test_contract_violations_detected() {
        let mut graph = minimal_graph("run-1");
        graph.events.pop();
        graph.outcomes[0].confidence = None;

        let violations = graph.contract_violations();
        assert!(violations.iter().any(|v| v.contains("last event")));
        assert!(violations.iter().any(|v| v.contains("confidence")));
        assert!(graph.check_contract().is_err());
    }

    #[test]
    fn test_insert_event_resequences() {
        let mut graph = minimal_graph("run-1");
        let note = ReasoningEvent::new(
            "other",
            "Note",
            EventPayload::ReasoningStep(ReasoningNote::BindingSummary { bound: 0, missing: vec![] }),
        );
        graph.insert_event(1, note);

        assert_eq!(graph.events[1].kind(), EventKind::ReasoningStep);
        assert_eq!(graph.events[1].run_id, "run-1");
        let seqs: Vec<u64> = graph.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_primary_wins_and_dedups() {
        let primary = minimal_graph("run-1");
        let mut secondary = primary.clone();
        secondary.events[0].title = "Stale title".into();
        secondary.outcomes[0].headline = "Stale headline".into();

        let mut extra = ReasoningEvent::new(
            "run-1",
            "Artifact",
            EventPayload::ArtifactEmitted(ArtifactRef {
                artifact_id: "art-1".into(),
                kind: "report".into(),
                title: "Report".into(),
                uri: None,
            }),
        );
        extra.ts = primary.events[1].ts + Duration::milliseconds(1);
        secondary.events.push(extra);

        let merged = merge_graphs(&primary, &secondary);
        assert_eq!(merged.events.len(), 4);
        assert_eq!(merged.events[0].title, "Run started");
        assert_eq!(merged.outcomes.len(), 1);
        assert_eq!(merged.outcomes[0].headline, "Done");

        let ids: HashSet<&str> = merged.events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids.len(), merged.events.len());
        let seqs: Vec<u64> = merged.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_keeps_terminal_last_for_late_events() {
        let primary = minimal_graph("run-1");
        let mut secondary = ReasoningGraph::empty("run-1");

        let mut late = ReasoningEvent::new(
            "run-1",
            "Late artifact",
            EventPayload::ArtifactEmitted(ArtifactRef {
                artifact_id: "art-late".into(),
                kind: "report".into(),
                title: "Late report".into(),
                uri: None,
            }),
        );
        late.ts = primary.events[2].ts + Duration::seconds(5);
        let mut second_terminal = ReasoningEvent::new(
            "run-1",
            "Run completed again",
            EventPayload::RunCompleted { status: RunStatus::Complete },
        );
        second_terminal.ts = late.ts + Duration::seconds(1);
        secondary.events.push(late);
        secondary.events.push(second_terminal);

        let merged = merge_graphs(&primary, &secondary);
        let kinds: Vec<EventKind> = merged.events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::RunStarted,
                EventKind::OutcomeFinalized,
                EventKind::ArtifactEmitted,
                EventKind::RunCompleted,
            ]
        );
        assert_eq!(merged.events[3].event_id, primary.events[2].event_id);
        assert!(merged.contract_violations().is_empty(), "{:?}", merged.contract_violations());
    }
}
