//! Strategy registry
//!
//! Filled once at startup, read-only afterwards. Unknown or absent names
//! resolve to the deterministic runner.

use super::{DeterministicRunner, ModelPlannerRunner, MultiAgentRunner, Runner, DETERMINISTIC};
use std::collections::HashMap;
use std::sync::Arc;

pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    /// Registry with no strategies besides the deterministic fallback
    pub fn new() -> Self {
        let mut registry = Self {
            runners: HashMap::new(),
        };
        registry.register(Arc::new(DeterministicRunner::new()));
        registry
    }

    /// Deterministic, model planner and multi-agent strategies
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ModelPlannerRunner::new()));
        registry.register(Arc::new(MultiAgentRunner::new()));
        registry
    }

    /// Register under the runner's own name, replacing any previous entry
    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        self.runners.insert(runner.name().to_string(), runner);
    }

    /// Look up a strategy; `None` and unknown names give the deterministic runner
    pub fn get(&self, name: Option<&str>) -> Arc<dyn Runner> {
        let requested = name.unwrap_or(DETERMINISTIC);
        if let Some(runner) = self.runners.get(requested) {
            return runner.clone();
        }
        tracing::debug!(strategy = requested, "unknown strategy, using deterministic");
        match self.runners.get(DETERMINISTIC) {
            Some(runner) => runner.clone(),
            None => Arc::new(DeterministicRunner::new()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    /// Registered strategy names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EventKind, RunStatus};
    use crate::runner::{MODEL_PLANNER, MULTI_AGENT};
    use crate::types::RunContext;

    #[test]
    fn test_defaults_registered() {
        let registry = RunnerRegistry::with_defaults();
        assert_eq!(registry.names(), vec![DETERMINISTIC, MODEL_PLANNER, MULTI_AGENT]);
        assert_eq!(registry.get(Some(MULTI_AGENT)).name(), MULTI_AGENT);
    }

    #[test]
    fn test_unknown_and_absent_fall_back() {
        let registry = RunnerRegistry::with_defaults();
        assert_eq!(registry.get(None).name(), DETERMINISTIC);
        assert_eq!(registry.get(Some("quantum")).name(), DETERMINISTIC);
        assert!(!registry.contains("quantum"));
    }

    #[test]
    fn test_resolved_runner_executes() {
        let registry = RunnerRegistry::with_defaults();
        let context = RunContext::new("run-reg", "scope-1", "Registry run");

        let result = tokio_test::block_on(registry.get(Some(MULTI_AGENT)).execute(&context, None));

        assert_eq!(result.status, RunStatus::Complete);
        assert_eq!(result.graph.count(EventKind::RunCompleted), 1);
    }
}
