//! Core types shared by the scorer, the graph and the runners
//!
//! A pointer is a path into a run's input/output slots (`/inputs/site`).
//! Candidate records come from the vault; a run context is what the
//! caller hands to a runner and never changes afterwards.

use crate::error::SpineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A validated path-like slot name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pointer(String);

impl Pointer {
    pub fn parse(raw: &str) -> Result<Self, SpineError> {
        let invalid = |reason| SpineError::InvalidPointer {
            pointer: raw.to_string(),
            reason,
        };

        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        if raw.len() == 1 {
            return Err(invalid("must name at least one segment"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("must not contain whitespace"));
        }
        if raw[1..].split('/').any(str::is_empty) {
            return Err(invalid("must not contain empty segments"));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment (`/inputs/site` -> `site`)
    pub fn leaf(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl TryFrom<String> for Pointer {
    type Error = SpineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Pointer::parse(&value)
    }
}

impl From<Pointer> for String {
    fn from(pointer: Pointer) -> Self {
        pointer.0
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a comma-separated pointer list (used by the CLI)
pub fn parse_pointer_list(raw: &str) -> Result<Vec<Pointer>, SpineError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Pointer::parse)
        .collect()
}

/// How relevant a vault record is to the pointer it exposes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Relevance {
    Low,
    Medium,
    High,
}

impl Relevance {
    /// Weight fed into the relevance term of the candidate score
    pub fn weight(&self) -> f64 {
        match self {
            Relevance::High => 1.0,
            Relevance::Medium => 0.6,
            Relevance::Low => 0.2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Relevance::High => "high",
            Relevance::Medium => "medium",
            Relevance::Low => "low",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "high" => Some(Relevance::High),
            "medium" => Some(Relevance::Medium),
            "low" => Some(Relevance::Low),
            _ => None,
        }
    }
}

/// Where inside a source document a value came from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProvenanceSpan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_end: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
}

impl ProvenanceSpan {
    /// True when the span locates anything at all
    pub fn has_location(&self) -> bool {
        self.page.is_some()
            || self.char_start.is_some()
            || self.line.is_some()
            || self.quote.is_some()
    }
}

/// One index entry: a vault object exposing a value for one pointer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub object_id: String,
    pub record_type: String,
    pub pointer: Pointer,
    #[serde(default)]
    pub value: serde_json::Value,
    pub confidence: f64,
    pub relevance: Relevance,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ProvenanceSpan>,
}

/// Explainable score of one candidate object; every component is already weighted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateScoreBreakdown {
    pub object_id: String,
    pub label: String,
    pub relevance: f64,
    pub confidence: f64,
    pub coverage: f64,
    pub recency: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical: Option<f64>,
    pub total: f64,
    pub selected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CandidateScoreBreakdown {
    /// Sum of the weighted components
    pub fn component_sum(&self) -> f64 {
        self.relevance
            + self.confidence
            + self.coverage
            + self.recency
            + self.historical.unwrap_or(0.0)
    }
}

/// A proposed pointer -> object binding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedBinding {
    pub pointer: Pointer,
    pub object_id: String,
    pub confidence: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadinessResult {
    pub required_missing: Vec<Pointer>,
    pub optional_missing: Vec<Pointer>,
    pub ranked_candidates: Vec<CandidateScoreBreakdown>,
    pub suggested_bindings: Vec<SuggestedBinding>,
}

impl ReadinessResult {
    /// Every required pointer is exposed by some candidate
    pub fn is_ready(&self) -> bool {
        self.required_missing.is_empty()
    }
}

/// Caller-side reference to the vault object bound to a pointer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultRef {
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<Relevance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ProvenanceSpan>,
}

impl VaultRef {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            ..Default::default()
        }
    }
}

/// Everything a runner needs to know about one run
///
/// Built once by the caller and never mutated. `run_id` partitions every
/// record the run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub scope_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub input_bindings: BTreeMap<Pointer, VaultRef>,
    /// Pointers the skill/flow cannot run without
    #[serde(default)]
    pub required_inputs: Vec<Pointer>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, scope_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            scope_id: scope_id.into(),
            title: title.into(),
            skill_id: None,
            flow_id: None,
            input_bindings: BTreeMap::new(),
            required_inputs: Vec::new(),
        }
    }

    pub fn with_binding(mut self, pointer: Pointer, vault_ref: VaultRef) -> Self {
        self.input_bindings.insert(pointer, vault_ref);
        self
    }

    pub fn with_required(mut self, pointers: Vec<Pointer>) -> Self {
        self.required_inputs = pointers;
        self
    }

    /// Required pointers with no caller-supplied binding
    pub fn missing_required(&self) -> Vec<Pointer> {
        self.required_inputs
            .iter()
            .filter(|p| !self.input_bindings.contains_key(*p))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_parse_valid() {
        let p = Pointer::parse("/inputs/site").unwrap();
        assert_eq!(p.as_str(), "/inputs/site");
        assert_eq!(p.leaf(), "site");
    }

    #[test]
    fn test_pointer_parse_rejects_malformed() {
        assert!(Pointer::parse("inputs/site").is_err());
        assert!(Pointer::parse("/").is_err());
        assert!(Pointer::parse("/inputs//site").is_err());
        assert!(Pointer::parse("/inputs/site/").is_err());
        assert!(Pointer::parse("/inputs/my site").is_err());
    }

    #[test]
    fn test_pointer_deserialize_validates() {
        let ok: Result<Pointer, _> = serde_json::from_str("\"/a/b\"");
        assert!(ok.is_ok());
        let bad: Result<Pointer, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_parse_pointer_list() {
        let list = parse_pointer_list("/inputs/site, /inputs/date,").unwrap();
        assert_eq!(list.len(), 2);
        assert!(parse_pointer_list("/ok,bad").is_err());
    }

    #[test]
    fn test_relevance_ordering_and_weights() {
        assert!(Relevance::High > Relevance::Medium);
        assert!(Relevance::Medium > Relevance::Low);
        assert_eq!(Relevance::High.weight(), 1.0);
        assert_eq!(Relevance::Medium.weight(), 0.6);
        assert_eq!(Relevance::Low.weight(), 0.2);
    }

    #[test]
    fn test_missing_required() {
        let site = Pointer::parse("/inputs/site").unwrap();
        let date = Pointer::parse("/inputs/date").unwrap();
        let ctx = RunContext::new("run-1", "scope", "Check")
            .with_binding(site.clone(), VaultRef::new("obj-1"))
            .with_required(vec![site, date.clone()]);

        assert_eq!(ctx.missing_required(), vec![date]);
    }
}
