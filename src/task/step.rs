//! Step callables, the context they receive, and the result they produce.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::metadata::{Metadata, MetadataValue};
use super::verification::VerificationResult;
use crate::budget::BudgetHandle;
use crate::memory::MemoryAccessor;

/// Outcome of one execution attempt of a step.
///
/// # Invariants
/// - `confidence` is in `[0.0, 1.0]`
/// - `error.is_some()` whenever the engine itself marks the result failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Filled in by the engine when the result is stored
    #[serde(default)]
    pub step_id: String,
    pub success: bool,
    /// Opaque payload produced by the step
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    /// Wall time of the attempt, measured by the engine
    #[serde(default)]
    pub duration_ms: u64,
    pub confidence: f64,
    /// Model that produced the result, used for pricing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl StepResult {
    /// Create a successful result with full confidence.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            step_id: String::new(),
            success: true,
            data,
            error: None,
            tokens_used: 0,
            duration_ms: 0,
            confidence: 1.0,
            model: None,
            metadata: Metadata::new(),
        }
    }

    /// Create a failed result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            step_id: String::new(),
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            tokens_used: 0,
            duration_ms: 0,
            confidence: 0.0,
            model: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_tokens(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }

    /// Set the confidence, clamped into `[0.0, 1.0]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Confidence on the 0-100 scale used by thresholds.
    ///
    /// NaN reads as 0; values outside `[0.0, 1.0]` are clamped.
    pub fn confidence_percent(&self) -> f64 {
        if self.confidence.is_nan() {
            return 0.0;
        }
        (self.confidence * 100.0).clamp(0.0, 100.0)
    }
}

/// View handed to a step's execute, verify and rollback calls.
///
/// Rebuilt for every invocation; `previous_results` is a snapshot and never
/// observes later mutations of the run state.
#[derive(Clone)]
pub struct StepContext {
    pub task_id: String,
    pub step_id: String,
    pub step_index: usize,
    /// 0 for the first try, incremented per retry
    pub attempt: u32,
    pub previous_results: Arc<HashMap<String, StepResult>>,
    pub memory: Arc<dyn MemoryAccessor>,
    pub budget: BudgetHandle,
    /// Cancelled when the task is cancelled; long steps should watch it
    pub cancellation: CancellationToken,
}

impl StepContext {
    /// Result of an earlier step in this run, if it completed.
    pub fn previous(&self, step_id: &str) -> Option<&StepResult> {
        self.previous_results.get(step_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("task_id", &self.task_id)
            .field("step_id", &self.step_id)
            .field("step_index", &self.step_index)
            .field("attempt", &self.attempt)
            .field("previous_results", &self.previous_results.len())
            .finish()
    }
}

/// The work a step performs.
#[async_trait]
pub trait StepExecute: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> anyhow::Result<StepResult>;
}

/// Optional post-check of a step's result.
#[async_trait]
pub trait StepVerify: Send + Sync {
    async fn verify(
        &self,
        result: StepResult,
        ctx: StepContext,
    ) -> anyhow::Result<VerificationResult>;
}

/// Optional compensation run after a step exhausts its retries.
#[async_trait]
pub trait StepRollback: Send + Sync {
    async fn rollback(&self, ctx: StepContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> StepExecute for F
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StepResult>> + Send,
{
    async fn execute(&self, ctx: StepContext) -> anyhow::Result<StepResult> {
        (self)(ctx).await
    }
}

#[async_trait]
impl<F, Fut> StepVerify for F
where
    F: Fn(StepResult, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<VerificationResult>> + Send,
{
    async fn verify(
        &self,
        result: StepResult,
        ctx: StepContext,
    ) -> anyhow::Result<VerificationResult> {
        (self)(result, ctx).await
    }
}

#[async_trait]
impl<F, Fut> StepRollback for F
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn rollback(&self, ctx: StepContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(StepResult::success(serde_json::Value::Null).confidence, 1.0);
        assert_eq!(
            StepResult::success(serde_json::Value::Null)
                .with_confidence(1.7)
                .confidence,
            1.0
        );
        assert_eq!(
            StepResult::success(serde_json::Value::Null)
                .with_confidence(f64::NAN)
                .confidence,
            0.0
        );
        let r = StepResult::success(serde_json::Value::Null).with_confidence(0.5);
        assert_eq!(r.confidence_percent(), 50.0);
    }

    #[test]
    fn test_confidence_percent_sanitizes_raw_field() {
        let mut r = StepResult::success(serde_json::Value::Null);
        r.confidence = f64::NAN;
        assert_eq!(r.confidence_percent(), 0.0);
        r.confidence = 1.7;
        assert_eq!(r.confidence_percent(), 100.0);
        r.confidence = -0.3;
        assert_eq!(r.confidence_percent(), 0.0);
    }

    #[test]
    fn test_failure_carries_error() {
        let r = StepResult::failure("tool crashed").with_tokens(10);
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("tool crashed"));
        assert_eq!(r.tokens_used, 10);
    }
}
