//! Configuration management with file, environment variable support and validation.

use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::context::Stage;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_thread_ids: bool,
    pub enable_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_thread_ids: false,
            enable_target: false,
        }
    }
}

/// Workflow execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub agent_timeout_ms: u64,
    pub run_deadline_secs: u64,
    pub max_fan_out: usize,
    pub max_discovery_topics: usize,
    pub critical_stages: Vec<Stage>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_timeout_ms: 30_000,
            run_deadline_secs: 300,
            max_fan_out: 4,
            max_discovery_topics: 5,
            critical_stages: vec![Stage::Discovering, Stage::Drafting],
        }
    }
}

impl OrchestratorConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }

    pub fn is_critical(&self, stage: Stage) -> bool {
        self.critical_stages.contains(&stage)
    }
}

/// Retry policy for transient agent failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub cool_down_ms: u64,
    pub slow_call_ms: u64,
    pub history_len: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cool_down_ms: 30_000,
            slow_call_ms: 60_000,
            history_len: 32,
        }
    }
}

impl HealthConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }
}

/// Retrieval memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub embedding_dim: usize,
    pub default_k: usize,
    pub max_records_per_user: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 64,
            default_k: 5,
            max_records_per_user: 5_000,
        }
    }
}

/// Preference learning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    pub alpha: f64,
    pub default_topics: Vec<String>,
    pub read_target_secs: f64,
    /// Content ids remembered for topic lookup; the oldest is evicted first.
    pub catalog_capacity: usize,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            default_topics: vec!["technology".to_string(), "business".to_string()],
            read_target_secs: 240.0,
            catalog_capacity: 10_000,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub memory: MemoryConfig,
    pub learner: LearnerConfig,
}

impl Settings {
    /// Load settings from the bundled defaults, an optional `digest.toml`
    /// in the working directory, and `DIGEST__*` environment variables.
    pub fn load() -> Result<Self> {
        Self::build(File::with_name("digest").required(false))
    }

    /// Same layering as [`Settings::load`], with an explicit config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(File::from(path).required(true))
    }

    fn build(local: File<config::FileSourceFile, FileFormat>) -> Result<Self> {
        let config = Config::builder()
            // Start with default settings
            .add_source(File::from_str(
                include_str!("../config.toml"),
                FileFormat::Toml,
            ))
            .add_source(local)
            // Environment variables such as DIGEST__LEARNER__ALPHA=0.3
            .add_source(
                Environment::with_prefix("DIGEST")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("learner.default_topics")
                    .with_list_parse_key("orchestrator.critical_stages")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if !(self.learner.alpha > 0.0 && self.learner.alpha <= 1.0) {
            return Err(anyhow!("learner.alpha must be in (0, 1], got {}", self.learner.alpha));
        }
        if self.learner.default_topics.is_empty() {
            return Err(anyhow!("learner.default_topics cannot be empty"));
        }
        if self.learner.read_target_secs <= 0.0 {
            return Err(anyhow!("learner.read_target_secs must be positive"));
        }
        if self.learner.catalog_capacity == 0 {
            return Err(anyhow!("learner.catalog_capacity must be at least 1"));
        }
        if self.health.failure_threshold == 0 {
            return Err(anyhow!("health.failure_threshold cannot be 0"));
        }
        if self.memory.embedding_dim == 0 {
            return Err(anyhow!("memory.embedding_dim cannot be 0"));
        }
        if self.memory.max_records_per_user == 0 {
            return Err(anyhow!("memory.max_records_per_user cannot be 0"));
        }
        if self.orchestrator.max_fan_out == 0 {
            return Err(anyhow!("orchestrator.max_fan_out cannot be 0"));
        }
        if self.orchestrator.agent_timeout_ms == 0 {
            return Err(anyhow!("orchestrator.agent_timeout_ms cannot be 0"));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(anyhow!(
                "retry.base_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.base_backoff_ms,
                self.retry.max_backoff_ms
            ));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.health.failure_threshold, 3);
        assert_eq!(settings.retry.max_retries, 3);
        assert!(settings.orchestrator.is_critical(Stage::Drafting));
        assert!(!settings.orchestrator.is_critical(Stage::Enhancing));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetryConfig {
            max_retries: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(60), Duration::from_millis(350));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[learner]\nalpha = 0.5\n\n[orchestrator]\ncritical_stages = [\"discovering\"]"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert!((settings.learner.alpha - 0.5).abs() < f64::EPSILON);
        assert_eq!(settings.orchestrator.critical_stages, vec![Stage::Discovering]);
        // Untouched sections keep the bundled defaults.
        assert_eq!(settings.memory.embedding_dim, 64);
    }

    #[test]
    fn test_invalid_alpha_is_rejected() {
        let mut settings = Settings::default();
        settings.learner.alpha = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_to_toml_renders_sections() {
        let rendered = Settings::default().to_toml().unwrap();
        assert!(rendered.contains("[health]"));
        assert!(rendered.contains("failure_threshold = 3"));
    }
}
