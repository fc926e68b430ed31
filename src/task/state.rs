//! Mutable run state, progress snapshots and final results.
//!
//! # Invariants
//! - `current_step_index` only increases
//! - `completed_steps` only grows
//! - `checkpoints` is append-only within a run
//! - `cost_used` is non-decreasing
//!
//! All mutations go through methods that enforce these.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::StepResult;
use crate::human::HumanPrompt;

/// Task-level status.
///
/// # State Machine
/// ```text
/// Pending -> Running <-> Paused
///               |
///               +-> Completed | Failed | Cancelled
/// ```
/// `AwaitingHuman` only appears in progress snapshots while a running task
/// waits on a prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    AwaitingHuman,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::AwaitingHuman => write!(f, "awaiting_human"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-step status within the step protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Verifying,
    Retrying,
    AwaitingHuman,
    Completed,
    Failed,
    Skipped,
}

/// State of one run, exclusively owned by its `TaskExecution`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionState {
    current_step_index: usize,
    completed_steps: BTreeSet<String>,
    #[serde(default)]
    failed_steps: BTreeSet<String>,
    results: HashMap<String, StepResult>,
    retry_counts: HashMap<String, u32>,
    checkpoints: Vec<String>,
    started_at: DateTime<Utc>,
    cost_used: f64,
}

impl Default for TaskExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutionState {
    pub fn new() -> Self {
        Self {
            current_step_index: 0,
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            results: HashMap::new(),
            retry_counts: HashMap::new(),
            checkpoints: Vec::new(),
            started_at: Utc::now(),
            cost_used: 0.0,
        }
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn completed_steps(&self) -> &BTreeSet<String> {
        &self.completed_steps
    }

    pub fn failed_steps(&self) -> &BTreeSet<String> {
        &self.failed_steps
    }

    pub fn results(&self) -> &HashMap<String, StepResult> {
        &self.results
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    pub fn retry_count(&self, step_id: &str) -> u32 {
        self.retry_counts.get(step_id).copied().unwrap_or(0)
    }

    pub fn total_retries(&self) -> u32 {
        self.retry_counts.values().sum()
    }

    pub fn checkpoints(&self) -> &[String] {
        &self.checkpoints
    }

    pub fn last_checkpoint(&self) -> Option<&str> {
        self.checkpoints.last().map(String::as_str)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cost_used(&self) -> f64 {
        self.cost_used
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_steps.contains(step_id)
    }

    /// Milliseconds since the run started.
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Move the cursor forward.
    ///
    /// # Postcondition
    /// `current_step_index == max(old, index)`
    pub fn advance_to(&mut self, index: usize) {
        if index > self.current_step_index {
            self.current_step_index = index;
        }
    }

    /// Store a successful result and mark the step completed.
    pub fn record_success(&mut self, result: StepResult) {
        self.failed_steps.remove(&result.step_id);
        self.completed_steps.insert(result.step_id.clone());
        self.results.insert(result.step_id.clone(), result);
    }

    /// Store the final result of a step that exhausted its retries.
    pub fn record_failure(&mut self, result: StepResult) {
        if !self.completed_steps.contains(&result.step_id) {
            self.failed_steps.insert(result.step_id.clone());
            self.results.insert(result.step_id.clone(), result);
        }
    }

    pub fn record_retry(&mut self, step_id: &str) {
        *self.retry_counts.entry(step_id.to_string()).or_insert(0) += 1;
    }

    pub fn push_checkpoint(&mut self, checkpoint_id: impl Into<String>) {
        let checkpoint_id = checkpoint_id.into();
        if self.checkpoints.last() != Some(&checkpoint_id) {
            self.checkpoints.push(checkpoint_id);
        }
    }

    /// Add cost; negative or NaN amounts are ignored.
    pub fn add_cost(&mut self, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.cost_used += cost;
        }
    }

    /// Average duration of stored successful steps times remaining steps.
    pub fn estimate_remaining_ms(&self, total_steps: usize) -> Option<u64> {
        let durations: Vec<u64> = self
            .results
            .values()
            .filter(|r| r.success)
            .map(|r| r.duration_ms)
            .collect();
        if durations.is_empty() {
            return None;
        }
        let avg = durations.iter().sum::<u64>() / durations.len() as u64;
        let done = self.completed_steps.len() + self.failed_steps.len();
        Some(avg * total_steps.saturating_sub(done) as u64)
    }
}

/// Read-only view of a run, computed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub current_step_index: usize,
    pub current_step_id: Option<String>,
    pub current_step_status: StepStatus,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
    pub cost_used: f64,
    pub budget_limit: Option<f64>,
    pub last_checkpoint: Option<String>,
    pub pending_prompt: Option<HumanPrompt>,
}

impl TaskProgress {
    /// Fraction of steps that reached a terminal state, in `[0.0, 1.0]`.
    pub fn fraction_done(&self) -> f64 {
        if self.total_steps == 0 {
            return 1.0;
        }
        ((self.completed_steps + self.failed_steps) as f64 / self.total_steps as f64).min(1.0)
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub status: TaskStatus,
    /// Stored step results in definition order
    pub results: Vec<StepResult>,
    pub total_duration_ms: u64,
    pub total_cost: f64,
    pub total_retries: u32,
    pub checkpoints: Vec<String>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }
}
