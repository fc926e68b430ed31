//! Configuration management for the engine.
//!
//! Configuration can be set via environment variables:
//! - `RELIANT_MAX_RETRIES` - Optional. Retries per step after the first attempt. Defaults to `3`.
//! - `RELIANT_RETRY_STRATEGY` - Optional. `exponential`, `linear` or `immediate`. Defaults to `exponential`.
//! - `RELIANT_STEP_TIMEOUT_MS` - Optional. Per-attempt step timeout. Defaults to `300000`.
//! - `RELIANT_BUDGET_LIMIT` - Optional. Cost limit in USD per task. Unset means unlimited.
//! - `RELIANT_CONFIDENCE_THRESHOLD` - Optional. 0-100. Defaults to `70`.
//! - `RELIANT_CHECKPOINT_FREQUENCY` - Optional. `every_step`, `on_success` or `manual`. Defaults to `on_success`.
//! - `RELIANT_REQUIRE_HUMAN_APPROVAL` - Optional. `true`/`false`. Defaults to `false`.
//! - `RELIANT_HUMAN_TIMEOUT_SECS` - Optional. Confirmation prompt timeout. Defaults to `300`.
//! - `RELIANT_CHECKPOINT_STORE` - Optional. `memory`, `file` or `sqlite`. Defaults to `memory`.
//! - `RELIANT_CHECKPOINT_DIR` - Optional. Directory for file/sqlite stores. Defaults to `./.reliant`.
//! - `RELIANT_EVENT_CAPACITY` - Optional. Event channel capacity. Defaults to `1024`.
//! - `DEFAULT_MODEL` - Optional. Model used for pricing when a step reports none. Defaults to `claude-sonnet-4`.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::checkpoint::CheckpointStoreType;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::task::{CheckpointFrequency, RetryStrategy, TaskConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Defaults merged under every definition's overrides
    pub task_defaults: TaskConfig,

    /// Checkpoint backend
    pub checkpoint_store: CheckpointStoreType,

    /// Directory for persistent checkpoint backends
    pub checkpoint_dir: PathBuf,

    /// Broadcast channel capacity
    pub event_capacity: usize,

    /// Model used for pricing when a step result names none
    pub default_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_defaults: TaskConfig::default(),
            checkpoint_store: CheckpointStoreType::Memory,
            checkpoint_dir: PathBuf::from("./.reliant"),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            default_model: "claude-sonnet-4".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut task = defaults.task_defaults.clone();

        if let Some(v) = lookup("RELIANT_MAX_RETRIES") {
            task.max_retries = parse_number("RELIANT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("RELIANT_RETRY_STRATEGY") {
            task.retry_strategy = RetryStrategy::parse(&v).ok_or_else(|| {
                invalid("RELIANT_RETRY_STRATEGY", "expected exponential, linear or immediate")
            })?;
        }
        if let Some(v) = lookup("RELIANT_STEP_TIMEOUT_MS") {
            task.timeout_ms = parse_number("RELIANT_STEP_TIMEOUT_MS", &v)?;
            if task.timeout_ms == 0 {
                return Err(invalid("RELIANT_STEP_TIMEOUT_MS", "must be positive"));
            }
        }
        if let Some(v) = lookup("RELIANT_BUDGET_LIMIT") {
            let limit: f64 = parse_number("RELIANT_BUDGET_LIMIT", &v)?;
            if limit.is_nan() || limit <= 0.0 {
                return Err(invalid("RELIANT_BUDGET_LIMIT", "must be positive"));
            }
            task.budget_limit = Some(limit);
        }
        if let Some(v) = lookup("RELIANT_CONFIDENCE_THRESHOLD") {
            let threshold: f64 = parse_number("RELIANT_CONFIDENCE_THRESHOLD", &v)?;
            if !(0.0..=100.0).contains(&threshold) {
                return Err(invalid("RELIANT_CONFIDENCE_THRESHOLD", "must be within 0-100"));
            }
            task.confidence_threshold = threshold;
        }
        if let Some(v) = lookup("RELIANT_CHECKPOINT_FREQUENCY") {
            task.checkpoint_frequency = CheckpointFrequency::parse(&v).ok_or_else(|| {
                invalid(
                    "RELIANT_CHECKPOINT_FREQUENCY",
                    "expected every_step, on_success or manual",
                )
            })?;
        }
        if let Some(v) = lookup("RELIANT_REQUIRE_HUMAN_APPROVAL") {
            task.require_human_approval = parse_bool("RELIANT_REQUIRE_HUMAN_APPROVAL", &v)?;
        }
        if let Some(v) = lookup("RELIANT_HUMAN_TIMEOUT_SECS") {
            let secs: u64 = parse_number("RELIANT_HUMAN_TIMEOUT_SECS", &v)?;
            task.human_timeout_ms = secs.saturating_mul(1000);
        }

        let checkpoint_store = match lookup("RELIANT_CHECKPOINT_STORE") {
            Some(v) => CheckpointStoreType::parse(&v).ok_or_else(|| {
                invalid("RELIANT_CHECKPOINT_STORE", "expected memory, file or sqlite")
            })?,
            None => defaults.checkpoint_store,
        };

        let checkpoint_dir = lookup("RELIANT_CHECKPOINT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.checkpoint_dir);

        let event_capacity = match lookup("RELIANT_EVENT_CAPACITY") {
            Some(v) => parse_number("RELIANT_EVENT_CAPACITY", &v)?,
            None => defaults.event_capacity,
        };

        let default_model = lookup("DEFAULT_MODEL")
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(defaults.default_model);

        Ok(Self {
            task_defaults: task,
            checkpoint_store,
            checkpoint_dir,
            event_capacity,
            default_model,
        })
    }
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue(name.to_string(), reason.to_string())
}

fn parse_number<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("expected a boolean, got '{}'", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.task_defaults, TaskConfig::default());
        assert_eq!(config.checkpoint_store, CheckpointStoreType::Memory);
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.default_model, "claude-sonnet-4");
    }

    #[test]
    fn test_values_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("RELIANT_MAX_RETRIES", "5"),
            ("RELIANT_RETRY_STRATEGY", "linear"),
            ("RELIANT_BUDGET_LIMIT", "2.5"),
            ("RELIANT_CONFIDENCE_THRESHOLD", "85"),
            ("RELIANT_CHECKPOINT_FREQUENCY", "manual"),
            ("RELIANT_REQUIRE_HUMAN_APPROVAL", "yes"),
            ("RELIANT_HUMAN_TIMEOUT_SECS", "30"),
            ("RELIANT_CHECKPOINT_STORE", "sqlite"),
            ("RELIANT_CHECKPOINT_DIR", "/tmp/cp"),
            ("DEFAULT_MODEL", "gpt-4o"),
        ]))
        .unwrap();

        let task = &config.task_defaults;
        assert_eq!(task.max_retries, 5);
        assert_eq!(task.retry_strategy, RetryStrategy::Linear);
        assert_eq!(task.budget_limit, Some(2.5));
        assert_eq!(task.confidence_threshold, 85.0);
        assert_eq!(task.checkpoint_frequency, CheckpointFrequency::Manual);
        assert!(task.require_human_approval);
        assert_eq!(task.human_timeout_ms, 30_000);
        assert_eq!(config.checkpoint_store, CheckpointStoreType::Sqlite);
        assert_eq!(config.checkpoint_dir, PathBuf::from("/tmp/cp"));
        assert_eq!(config.default_model, "gpt-4o");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for (name, value) in [
            ("RELIANT_MAX_RETRIES", "-1"),
            ("RELIANT_RETRY_STRATEGY", "fibonacci"),
            ("RELIANT_STEP_TIMEOUT_MS", "0"),
            ("RELIANT_BUDGET_LIMIT", "0"),
            ("RELIANT_CONFIDENCE_THRESHOLD", "150"),
            ("RELIANT_REQUIRE_HUMAN_APPROVAL", "sometimes"),
            ("RELIANT_CHECKPOINT_STORE", "redis"),
        ] {
            let err = EngineConfig::from_lookup(lookup(&[(name, value)])).unwrap_err();
            match err {
                ConfigError::InvalidValue(var, _) => assert_eq!(var, name),
            }
        }
    }
}
