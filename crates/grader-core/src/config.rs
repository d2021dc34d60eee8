//! Grader configuration.
//!
//! Read from `grader.toml` and/or `GRADER_*` environment variables. The CLI
//! overlays its flags on top.
//!
//! ```toml
//! max_workers = 4
//! opinion_workers = 3
//! batch_timeout_secs = 300
//! cache_dir = ".grader-cache"
//!
//! [policy]
//! kind = "adjudicated"
//! opinions = 3
//!
//! [cache]
//! model_call = 7200
//!
//! [model]
//! model = "gpt-4o-mini"
//! temperature = 0.1
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::CacheTtls;
use crate::consensus::ConsensusPolicy;
use crate::domain::{GraderError, Result};
use crate::model::ModelConfig;

fn default_workers() -> usize {
    3
}

/// Process-wide grader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraderConfig {
    /// Artifacts evaluated concurrently.
    #[serde(default = "default_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub policy: ConsensusPolicy,

    /// Opinion calls in flight per artifact.
    #[serde(default = "default_workers")]
    pub opinion_workers: usize,

    /// Whole-batch deadline; unset means no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout_secs: Option<u64>,

    /// Filesystem cache root; unset means an in-memory cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub cache: CacheTtls,

    #[serde(default)]
    pub model: ModelConfig,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            policy: ConsensusPolicy::default(),
            opinion_workers: default_workers(),
            batch_timeout_secs: None,
            cache_dir: None,
            cache: CacheTtls::default(),
            model: ModelConfig::default(),
        }
    }
}

impl GraderConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "loaded grader config");
        Ok(config)
    }

    /// Overlay `GRADER_*` variables (and the model's own variables) onto `self`.
    pub fn merge_env(self) -> Result<Self> {
        let mut config = self.merge_vars(|name| std::env::var(name).ok())?;
        config.model = config.model.merge_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay variables resolved through `lookup`.
    ///
    /// Recognised: `GRADER_MAX_WORKERS`, `GRADER_POLICY`,
    /// `GRADER_OPINION_WORKERS`, `GRADER_BATCH_TIMEOUT_SECS`,
    /// `GRADER_CACHE_DIR`.
    pub fn merge_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("GRADER_MAX_WORKERS") {
            self.max_workers = parse_var("GRADER_MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("GRADER_POLICY") {
            self.policy = v
                .parse()
                .map_err(|e| GraderError::Config(format!("GRADER_POLICY: {e}")))?;
        }
        if let Some(v) = lookup("GRADER_OPINION_WORKERS") {
            self.opinion_workers = parse_var("GRADER_OPINION_WORKERS", &v)?;
        }
        if let Some(v) = lookup("GRADER_BATCH_TIMEOUT_SECS") {
            self.batch_timeout_secs = Some(parse_var("GRADER_BATCH_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("GRADER_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(v));
        }
        Ok(self)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_secs.map(Duration::from_secs)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(GraderError::Config("max_workers must be at least 1".into()));
        }
        if self.opinion_workers == 0 {
            return Err(GraderError::Config("opinion_workers must be at least 1".into()));
        }
        if let ConsensusPolicy::Adjudicated { opinions: 0 } = self.policy {
            return Err(GraderError::Config("policy.opinions must be at least 1".into()));
        }
        if self.batch_timeout_secs == Some(0) {
            return Err(GraderError::Config("batch_timeout_secs must be positive".into()));
        }
        if self.model.max_tokens == 0 {
            return Err(GraderError::Config("model.max_tokens must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(GraderError::Config(format!(
                "model.temperature {} outside 0.0..=2.0",
                self.model.temperature
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GraderError::Config(format!("{name}: cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_document_is_defaults() {
        let config = GraderConfig::from_toml_str("").unwrap();
        assert_eq!(config, GraderConfig::default());
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.policy, ConsensusPolicy::Adjudicated { opinions: 3 });
        assert_eq!(config.cache.query, 1800);
        assert!(config.batch_timeout().is_none());
    }

    #[test]
    fn full_document() {
        let config = GraderConfig::from_toml_str(
            r#"
            max_workers = 8
            batch_timeout_secs = 120
            cache_dir = "/tmp/grader"

            [policy]
            kind = "double_pass"

            [cache]
            model_call = 60

            [model]
            model = "gpt-4o"
            max_tokens = 400
            "#,
        )
        .unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.policy, ConsensusPolicy::DoublePass);
        assert_eq!(config.batch_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.cache.model_call, 60);
        assert_eq!(config.cache.response, 600);
        assert_eq!(config.model.model, "gpt-4o");
        assert_eq!(config.model.max_tokens, 400);
        assert_eq!(config.model.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for doc in [
            "max_workers = 0",
            "opinion_workers = 0",
            "batch_timeout_secs = 0",
            "[policy]\nkind = \"adjudicated\"\nopinions = 0",
            "[model]\ntemperature = 3.5",
        ] {
            assert!(
                matches!(GraderConfig::from_toml_str(doc), Err(GraderError::Config(_))),
                "accepted: {doc}"
            );
        }
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            GraderConfig::from_toml_str("max_workers = \"many\""),
            Err(GraderError::ConfigParse(_))
        ));
    }

    #[test]
    fn vars_overlay_defaults() {
        let vars = HashMap::from([
            ("GRADER_MAX_WORKERS", "5"),
            ("GRADER_POLICY", "adjudicated:4"),
            ("GRADER_BATCH_TIMEOUT_SECS", "30"),
            ("GRADER_CACHE_DIR", "cache"),
        ]);
        let config = GraderConfig::default()
            .merge_vars(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.policy, ConsensusPolicy::Adjudicated { opinions: 4 });
        assert_eq!(config.batch_timeout_secs, Some(30));
        assert_eq!(config.cache_dir, Some(PathBuf::from("cache")));
        assert_eq!(config.opinion_workers, 3);
    }

    #[test]
    fn bad_var_names_the_variable() {
        let err = GraderConfig::default()
            .merge_vars(|k| (k == "GRADER_MAX_WORKERS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("GRADER_MAX_WORKERS"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grader.toml");
        std::fs::write(&path, "opinion_workers = 2\n").unwrap();
        assert_eq!(GraderConfig::load(&path).unwrap().opinion_workers, 2);
    }
}
