//! Runtime configuration
//!
//! Defaults: 0.60 binding threshold, 500 usage records, deterministic
//! strategy. A `config.json` in the data directory overrides them.

use crate::runner::DETERMINISTIC;
use crate::scorer::ScoreWeights;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.60;
pub const DEFAULT_USAGE_CAP: usize = 500;
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpineConfig {
    /// Where the usage store, the graph ledger and the signing key live
    pub data_dir: PathBuf,
    /// Minimum candidate confidence for a suggested binding
    pub min_confidence: f64,
    /// Maximum number of usage records kept (newest first)
    pub usage_cap: usize,
    /// Write run-derived usage records to the store (events only otherwise)
    pub persist_usage: bool,
    /// Strategy used when a run does not name one
    pub default_strategy: String,
    pub weights: ScoreWeights,
}

impl Default for SpineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            usage_cap: DEFAULT_USAGE_CAP,
            persist_usage: false,
            default_strategy: DETERMINISTIC.to_string(),
            weights: ScoreWeights::default(),
        }
    }
}

impl SpineConfig {
    /// Load `config.json` from `data_dir`, falling back to defaults when absent
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self {
                data_dir: data_dir.to_path_buf(),
                ..Default::default()
            });
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let mut config: SpineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config in {:?}", path))?;
        config.data_dir = data_dir.to_path_buf();
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("min_confidence must be within [0, 1], got {}", self.min_confidence);
        }
        if self.usage_cap == 0 {
            anyhow::bail!("usage_cap must be at least 1");
        }
        for (name, weight) in self.weights.components() {
            if !(0.0..=1.0).contains(&weight) {
                anyhow::bail!("score weight {} must be within [0, 1], got {}", name, weight);
            }
        }
        let sum = self.weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("score weights must sum to 1.0, got {:.4}", sum);
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("spine.db")
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("ledger.key")
    }
}

/// XDG data dir on Linux, ~/Library/Application Support on macOS
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reasoning-spine")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let config = SpineConfig::load(dir.path()).unwrap();
        assert_eq!(config.min_confidence, 0.60);
        assert_eq!(config.usage_cap, 500);
        assert!(!config.persist_usage);
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn test_load_partial_override() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"min_confidence": 0.75, "persist_usage": true}"#,
        )
        .unwrap();

        let config = SpineConfig::load(dir.path()).unwrap();
        assert_eq!(config.min_confidence, 0.75);
        assert!(config.persist_usage);
        assert_eq!(config.usage_cap, 500);
    }

    #[test]
    fn test_load_rejects_bad_threshold() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"min_confidence": 1.5}"#).unwrap();
        assert!(SpineConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_load_rejects_negative_weight() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"weights": {"relevance": 1.3, "confidence": -0.3, "coverage": 0.0, "recency": 0.0, "historical": 0.0}}"#,
        )
        .unwrap();

        let err = SpineConfig::load(dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("relevance"));
    }
}
