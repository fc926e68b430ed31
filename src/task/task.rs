//! Task and step declarations plus run-wide policy.
//!
//! # Invariants
//! - A `TaskDefinition` is never mutated by the engine
//! - Step ids are unique within a definition (checked by `validate`)

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::metadata::{Metadata, MetadataValue};
use super::step::{StepExecute, StepRollback, StepVerify};
use crate::error::EngineError;

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Linear,
    Immediate,
}

impl RetryStrategy {
    /// Parse from a configuration value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "exponential" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            "immediate" => Some(Self::Immediate),
            _ => None,
        }
    }
}

/// When checkpoints are written automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    /// After every step, including non-critical failures
    EveryStep,
    /// After every successful step
    #[default]
    OnSuccess,
    /// Only when requested through the orchestrator
    Manual,
}

impl CheckpointFrequency {
    /// Parse from a configuration value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "every_step" | "every-step" => Some(Self::EveryStep),
            "on_success" | "on-success" => Some(Self::OnSuccess),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Run-wide policy, fully resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Retries per step after the first attempt
    pub max_retries: u32,
    pub retry_strategy: RetryStrategy,
    /// Per-attempt timeout for a step's execute call
    pub timeout_ms: u64,
    /// Cost limit in USD (`None` disables budget checks)
    pub budget_limit: Option<f64>,
    /// Ask a human to approve every step result
    pub require_human_approval: bool,
    pub checkpoint_frequency: CheckpointFrequency,
    /// Minimum confidence (0-100) accepted without human confirmation
    pub confidence_threshold: f64,
    /// How long a confirmation prompt waits for an answer
    pub human_timeout_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_strategy: RetryStrategy::Exponential,
            timeout_ms: 300_000,
            budget_limit: None,
            require_human_approval: false,
            checkpoint_frequency: CheckpointFrequency::OnSuccess,
            confidence_threshold: 70.0,
            human_timeout_ms: 300_000,
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn human_timeout(&self) -> Duration {
        Duration::from_millis(self.human_timeout_ms)
    }

    /// Merge partial overrides on top of these defaults.
    pub fn merged(&self, overrides: &TaskConfigOverrides) -> TaskConfig {
        TaskConfig {
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            retry_strategy: overrides.retry_strategy.unwrap_or(self.retry_strategy),
            timeout_ms: overrides.timeout_ms.unwrap_or(self.timeout_ms),
            budget_limit: overrides.budget_limit.or(self.budget_limit),
            require_human_approval: overrides
                .require_human_approval
                .unwrap_or(self.require_human_approval),
            checkpoint_frequency: overrides
                .checkpoint_frequency
                .unwrap_or(self.checkpoint_frequency),
            confidence_threshold: overrides
                .confidence_threshold
                .unwrap_or(self.confidence_threshold),
            human_timeout_ms: overrides.human_timeout_ms.unwrap_or(self.human_timeout_ms),
        }
    }
}

/// Partial `TaskConfig` supplied with a definition; unset fields fall back
/// to the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_human_approval: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_frequency: Option<CheckpointFrequency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_timeout_ms: Option<u64>,
}

/// Per-step overrides of the task policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// A step is critical unless this is explicitly `false`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
}

impl StepConfig {
    pub fn is_critical(&self) -> bool {
        self.critical != Some(false)
    }
}

/// One unit of work inside a task.
#[derive(Clone)]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub execute: Arc<dyn StepExecute>,
    pub verify: Option<Arc<dyn StepVerify>>,
    pub rollback: Option<Arc<dyn StepRollback>>,
    pub config: StepConfig,
}

impl StepDefinition {
    /// Create a step; `name` defaults to the id.
    pub fn new(id: impl Into<String>, execute: impl StepExecute + 'static) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            execute: Arc::new(execute),
            verify: None,
            rollback: None,
            config: StepConfig::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_verify(mut self, verify: impl StepVerify + 'static) -> Self {
        self.verify = Some(Arc::new(verify));
        self
    }

    pub fn with_rollback(mut self, rollback: impl StepRollback + 'static) -> Self {
        self.rollback = Some(Arc::new(rollback));
        self
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.config.confidence_threshold = Some(threshold);
        self
    }

    /// Mark the step as optional: its failure does not abort the task.
    pub fn non_critical(mut self) -> Self {
        self.config.critical = Some(false);
        self
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_verify", &self.verify.is_some())
            .field("has_rollback", &self.rollback.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// Immutable declaration of work handed to the engine by a planner.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<StepDefinition>,
    pub config: TaskConfigOverrides,
    pub metadata: Metadata,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            config: TaskConfigOverrides::default(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_config(mut self, config: TaskConfigOverrides) -> Self {
        self.config = config;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Index of the step with the given id.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Step ids in definition order.
    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Reject malformed definitions before any step runs.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidDefinition("task id is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(EngineError::InvalidDefinition(format!(
                "task '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(EngineError::InvalidDefinition(format!(
                    "task '{}' has a step with an empty id",
                    self.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::InvalidDefinition(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if let Some(threshold) = step.config.confidence_threshold {
                check_threshold(threshold)?;
            }
            if step.config.timeout_ms == Some(0) {
                return Err(EngineError::InvalidDefinition(format!(
                    "step '{}' has a zero timeout",
                    step.id
                )));
            }
        }

        if let Some(threshold) = self.config.confidence_threshold {
            check_threshold(threshold)?;
        }
        if self.config.timeout_ms == Some(0) {
            return Err(EngineError::InvalidDefinition(
                "task timeout must be positive".to_string(),
            ));
        }
        if let Some(limit) = self.config.budget_limit {
            if limit.is_nan() || limit <= 0.0 {
                return Err(EngineError::InvalidDefinition(format!(
                    "budget limit must be positive, got {}",
                    limit
                )));
            }
        }
        Ok(())
    }
}

fn check_threshold(threshold: f64) -> Result<(), EngineError> {
    if (0.0..=100.0).contains(&threshold) {
        Ok(())
    } else {
        Err(EngineError::InvalidDefinition(format!(
            "confidence threshold {} outside 0-100",
            threshold
        )))
    }
}
