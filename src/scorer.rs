//! Pointer Index & Candidate Scorer
//!
//! Matches the pointers a run needs against vault candidate records:
//! 1. Finds pointers no candidate exposes at all
//! 2. Ranks candidate objects with an explainable, weighted breakdown
//! 3. Greedily proposes one object per required pointer
//!
//! Everything here is a pure function of its inputs plus `now`, which the
//! caller pins through [`ReadinessOptions`].

use crate::config::DEFAULT_MIN_CONFIDENCE;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Candidates older than this get no recency boost
pub const RECENCY_WINDOW_DAYS: f64 = 30.0;

/// How many candidates `suggest_inputs` returns per pointer
pub const MAX_SUGGESTIONS_PER_POINTER: usize = 3;

/// Weights of the five score components (must sum to 1.0)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub relevance: f64,
    pub confidence: f64,
    pub coverage: f64,
    pub recency: f64,
    /// Learned average contribution from past runs
    pub historical: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            relevance: 0.35,
            confidence: 0.25,
            coverage: 0.10,
            recency: 0.10,
            historical: 0.20,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.relevance + self.confidence + self.coverage + self.recency + self.historical
    }

    /// Named components, for validation messages
    pub fn components(&self) -> [(&'static str, f64); 5] {
        [
            ("relevance", self.relevance),
            ("confidence", self.confidence),
            ("coverage", self.coverage),
            ("recency", self.recency),
            ("historical", self.historical),
        ]
    }
}

/// Inputs to scoring that are not part of the index itself
#[derive(Debug, Clone)]
pub struct ReadinessOptions {
    pub min_confidence: f64,
    pub now: DateTime<Utc>,
    pub weights: ScoreWeights,
    /// Historical contribution per vault object id, in [0, 1]
    pub historical: HashMap<String, f64>,
}

impl Default for ReadinessOptions {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl ReadinessOptions {
    /// Options evaluated at a fixed instant
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            now,
            weights: ScoreWeights::default(),
            historical: HashMap::new(),
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_historical(mut self, historical: HashMap<String, f64>) -> Self {
        self.historical = historical;
        self
    }
}

/// The pointers a skill or flow declares
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputRequirements {
    #[serde(default)]
    pub required: Vec<Pointer>,
    #[serde(default)]
    pub optional: Vec<Pointer>,
}

/// Top candidates for one pointer, for "why was this chosen" views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSuggestion {
    pub pointer: Pointer,
    pub required: bool,
    pub candidates: Vec<CandidateScoreBreakdown>,
    /// Any of the returned candidates carries a locatable provenance span
    pub has_provenance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<SuggestedBinding>,
}

/// Readiness plus a pointer -> object mapping and a plain-language explanation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFillResult {
    pub readiness: ReadinessResult,
    pub suggestions: Vec<InputSuggestion>,
    pub mapping: BTreeMap<Pointer, String>,
    pub unbound_required: Vec<Pointer>,
    pub explanation: String,
}

/// All index entries of one vault object, folded together
struct ObjectAggregate<'a> {
    object_id: &'a str,
    entries: Vec<&'a CandidateRecord>,
    best_confidence: f64,
    best_relevance: Relevance,
    latest_update: DateTime<Utc>,
}

impl<'a> ObjectAggregate<'a> {
    fn new(first: &'a CandidateRecord) -> Self {
        Self {
            object_id: &first.object_id,
            entries: vec![first],
            best_confidence: unit_score(first.confidence),
            best_relevance: first.relevance,
            latest_update: first.updated_at,
        }
    }

    fn absorb(&mut self, entry: &'a CandidateRecord) {
        self.best_confidence = self.best_confidence.max(unit_score(entry.confidence));
        // High can never be downgraded by a later entry
        self.best_relevance = self.best_relevance.max(entry.relevance);
        self.latest_update = self.latest_update.max(entry.updated_at);
        self.entries.push(entry);
    }

    fn exposes(&self, pointer: &Pointer) -> bool {
        self.entries.iter().any(|e| &e.pointer == pointer)
    }

    /// Best confidence among the entries for one pointer
    fn confidence_for(&self, pointer: &Pointer) -> Option<f64> {
        self.entries
            .iter()
            .filter(|e| &e.pointer == pointer)
            .map(|e| unit_score(e.confidence))
            .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))))
    }

    fn satisfied(&self, required: &[Pointer]) -> usize {
        required.iter().filter(|p| self.exposes(p)).count()
    }

    fn label(&self) -> String {
        format!("{} {}", self.entries[0].record_type, self.object_id)
    }
}

/// Clamp into [0, 1]; NaN and infinities score as 0
fn unit_score(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn group_by_object(index: &[CandidateRecord]) -> BTreeMap<&str, ObjectAggregate<'_>> {
    let mut objects: BTreeMap<&str, ObjectAggregate<'_>> = BTreeMap::new();
    for entry in index {
        match objects.get_mut(entry.object_id.as_str()) {
            Some(agg) => agg.absorb(entry),
            None => {
                objects.insert(&entry.object_id, ObjectAggregate::new(entry));
            }
        }
    }
    objects
}

/// `max(0, 1 - age/30d)`, capped at 1 for entries dated in the future
pub fn recency_boost(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - updated_at).num_seconds() as f64 / 86_400.0;
    (1.0 - age_days / RECENCY_WINDOW_DAYS).clamp(0.0, 1.0)
}

fn score_object(
    object: &ObjectAggregate<'_>,
    required: &[Pointer],
    options: &ReadinessOptions,
) -> CandidateScoreBreakdown {
    let w = &options.weights;

    let relevance = w.relevance * object.best_relevance.weight();
    let confidence = w.confidence * object.best_confidence;
    let coverage = w.coverage * object.satisfied(required) as f64 / required.len().max(1) as f64;
    let recency = w.recency * recency_boost(object.latest_update, options.now);
    let historical = options
        .historical
        .get(object.object_id)
        .map(|h| w.historical * unit_score(*h));

    // Clamp absorbs float drift only; validated weights keep the sum in [0, 1]
    let total = (relevance + confidence + coverage + recency + historical.unwrap_or(0.0)).clamp(0.0, 1.0);

    CandidateScoreBreakdown {
        object_id: object.object_id.to_string(),
        label: object.label(),
        relevance,
        confidence,
        coverage,
        recency,
        historical,
        total,
        selected: false,
        reason: None,
    }
}

/// Highest score first, object id as the tie-breaker so ranking is stable
fn sort_ranked(ranked: &mut [CandidateScoreBreakdown]) {
    ranked.sort_by(|a, b| {
        b.total
            .partial_cmp(&a.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.object_id.cmp(&b.object_id))
    });
}

fn assign_bindings(
    required: &[Pointer],
    objects: &BTreeMap<&str, ObjectAggregate<'_>>,
    ranked: &mut [CandidateScoreBreakdown],
    min_confidence: f64,
) -> Vec<SuggestedBinding> {
    let mut used: HashSet<String> = HashSet::new();
    let mut bindings = Vec::new();

    for pointer in required {
        let mut chosen = None;

        for (i, candidate) in ranked.iter().enumerate() {
            if used.contains(&candidate.object_id) {
                continue;
            }
            let Some(object) = objects.get(candidate.object_id.as_str()) else {
                continue;
            };
            match object.confidence_for(pointer) {
                Some(c) if c >= min_confidence => {
                    chosen = Some((i, c, object.satisfied(required)));
                    break;
                }
                _ => {}
            }
        }

        if let Some((i, entry_confidence, satisfied)) = chosen {
            let candidate = &mut ranked[i];
            candidate.selected = true;
            candidate.reason = Some(format!(
                "Selected for {}: {} relevance, confidence {:.2} (threshold {:.2}), covers {}/{} required inputs",
                pointer,
                objects[candidate.object_id.as_str()].best_relevance.name(),
                entry_confidence,
                min_confidence,
                satisfied,
                required.len(),
            ));
            used.insert(candidate.object_id.clone());
            bindings.push(SuggestedBinding {
                pointer: pointer.clone(),
                object_id: candidate.object_id.clone(),
                confidence: entry_confidence,
                score: candidate.total,
            });
        }
    }

    // Explain why exposing-but-unselected candidates were passed over
    for candidate in ranked.iter_mut().filter(|c| !c.selected) {
        let Some(object) = objects.get(candidate.object_id.as_str()) else {
            continue;
        };
        let blocked: Vec<String> = required
            .iter()
            .filter(|p| object.confidence_for(p).is_some_and(|c| c < min_confidence))
            .map(|p| p.to_string())
            .collect();
        if !blocked.is_empty() {
            candidate.reason = Some(format!(
                "Confidence below threshold {:.2} for {}",
                min_confidence,
                blocked.join(", ")
            ));
        }
    }

    bindings
}

/// Compute which pointers are missing, rank candidates and propose bindings
pub fn compute_readiness(
    required: &[Pointer],
    optional: &[Pointer],
    index: &[CandidateRecord],
    options: &ReadinessOptions,
) -> ReadinessResult {
    let objects = group_by_object(index);
    let exposed: HashSet<&Pointer> = index.iter().map(|e| &e.pointer).collect();

    let required_missing = required
        .iter()
        .filter(|p| !exposed.contains(p))
        .cloned()
        .collect();
    let optional_missing = optional
        .iter()
        .filter(|p| !exposed.contains(p))
        .cloned()
        .collect();

    let mut ranked: Vec<CandidateScoreBreakdown> = objects
        .values()
        .map(|object| score_object(object, required, options))
        .collect();
    sort_ranked(&mut ranked);

    let suggested_bindings = assign_bindings(required, &objects, &mut ranked, options.min_confidence);

    ReadinessResult {
        required_missing,
        optional_missing,
        ranked_candidates: ranked,
        suggested_bindings,
    }
}

fn suggestions_from(
    requirements: &InputRequirements,
    index: &[CandidateRecord],
    readiness: &ReadinessResult,
) -> Vec<InputSuggestion> {
    let required = requirements.required.iter().map(|p| (p, true));
    let optional = requirements.optional.iter().map(|p| (p, false));

    required
        .chain(optional)
        .map(|(pointer, is_required)| {
            let exposing: HashSet<&str> = index
                .iter()
                .filter(|e| &e.pointer == pointer)
                .map(|e| e.object_id.as_str())
                .collect();

            let candidates: Vec<CandidateScoreBreakdown> = readiness
                .ranked_candidates
                .iter()
                .filter(|c| exposing.contains(c.object_id.as_str()))
                .take(MAX_SUGGESTIONS_PER_POINTER)
                .cloned()
                .collect();

            let has_provenance = index.iter().any(|e| {
                &e.pointer == pointer
                    && candidates.iter().any(|c| c.object_id == e.object_id)
                    && e.provenance.as_ref().is_some_and(ProvenanceSpan::has_location)
            });

            let binding = readiness
                .suggested_bindings
                .iter()
                .find(|b| &b.pointer == pointer)
                .cloned();

            InputSuggestion {
                pointer: pointer.clone(),
                required: is_required,
                candidates,
                has_provenance,
                binding,
            }
        })
        .collect()
}

/// Top candidates per pointer with provenance availability
pub fn suggest_inputs(
    requirements: &InputRequirements,
    index: &[CandidateRecord],
    options: &ReadinessOptions,
) -> Vec<InputSuggestion> {
    let readiness = compute_readiness(&requirements.required, &requirements.optional, index, options);
    suggestions_from(requirements, index, &readiness)
}

/// Suggest a full mapping and explain any required pointer left unbound
pub fn auto_fill_mapping(
    requirements: &InputRequirements,
    index: &[CandidateRecord],
    options: &ReadinessOptions,
) -> AutoFillResult {
    let readiness = compute_readiness(&requirements.required, &requirements.optional, index, options);
    let suggestions = suggestions_from(requirements, index, &readiness);

    let mapping: BTreeMap<Pointer, String> = readiness
        .suggested_bindings
        .iter()
        .map(|b| (b.pointer.clone(), b.object_id.clone()))
        .collect();

    let unbound_required: Vec<Pointer> = requirements
        .required
        .iter()
        .filter(|p| !mapping.contains_key(*p))
        .cloned()
        .collect();

    let explanation = explain_mapping(requirements, index, &readiness, &unbound_required, options.min_confidence);

    AutoFillResult {
        readiness,
        suggestions,
        mapping,
        unbound_required,
        explanation,
    }
}

fn explain_mapping(
    requirements: &InputRequirements,
    index: &[CandidateRecord],
    readiness: &ReadinessResult,
    unbound: &[Pointer],
    min_confidence: f64,
) -> String {
    let total = requirements.required.len();
    let bound: Vec<String> = readiness
        .suggested_bindings
        .iter()
        .map(|b| format!("{} -> {} (score {:.2})", b.pointer, b.object_id, b.score))
        .collect();

    if unbound.is_empty() {
        if total == 0 {
            return "No required inputs declared; nothing to bind.".to_string();
        }
        return format!("All {} required input(s) matched: {}.", total, bound.join("; "));
    }

    let reasons: Vec<String> = unbound
        .iter()
        .map(|pointer| {
            let best = index
                .iter()
                .filter(|e| &e.pointer == pointer)
                .map(|e| unit_score(e.confidence))
                .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))));
            match best {
                None => format!("{} (no vault object exposes it)", pointer),
                Some(c) if c < min_confidence => format!(
                    "{} (best candidate confidence {:.2} is below the {:.2} threshold)",
                    pointer, c, min_confidence
                ),
                Some(_) => format!(
                    "{} (every qualifying candidate is already bound to another input)",
                    pointer
                ),
            }
        })
        .collect();

    let mut explanation = format!(
        "Bound {} of {} required input(s). Unbound: {}.",
        total - unbound.len(),
        total,
        reasons.join("; ")
    );
    if !bound.is_empty() {
        explanation.push_str(&format!(" Bound: {}.", bound.join("; ")));
    }
    explanation
}
