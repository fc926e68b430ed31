//! Task execution - the per-task state machine and step protocol.
//!
//! # State Machine
//! ```text
//! Pending -> Running <-> Paused
//!               |
//!               +-> Completed | Failed | Cancelled
//! ```
//!
//! # Step Protocol
//! For every step, in definition order:
//! 1. check cancellation, wait on the pause gate
//! 2. execute under the step timeout
//! 3. verify (optional); a failed verification counts as a failed attempt
//! 4. confidence gate: low confidence (or forced approval) asks a human
//! 5. on success store the result, charge cost, check budget, checkpoint
//! 6. on exhaustion roll back (best effort) and record a failed result
//!
//! Step-level errors never escape `run()`; they end up in `TaskResult`.

mod gate;

pub use gate::PauseGate;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::budget::{cost_for_tokens, BudgetCheck, BudgetHandle, BudgetTracker};
use crate::checkpoint::{
    generate_checkpoint_id, CheckpointData, CheckpointStore, TaskSnapshot,
};
use crate::error::{CheckpointError, EngineError, ExecutionError, HumanInputError};
use crate::events::{EngineEvent, EventBus};
use crate::human::{ConfirmationDecision, HumanPrompt, HumanPromptBroker, PromptPriority, PromptType};
use crate::memory::MemoryAccessor;
use crate::retry::backoff_delay;
use crate::task::{
    CheckpointFrequency, StepContext, StepDefinition, StepResult, StepStatus, TaskConfig,
    TaskDefinition, TaskExecutionState, TaskProgress, TaskResult, TaskStatus,
};

/// Collaborators shared by every execution of an orchestrator.
#[derive(Clone)]
pub struct ExecutionServices {
    pub broker: Arc<HumanPromptBroker>,
    pub store: Arc<dyn CheckpointStore>,
    pub memory: Arc<dyn MemoryAccessor>,
    pub events: EventBus,
    /// Model used for pricing when a result names none
    pub default_model: String,
}

#[derive(Debug, Clone, Default)]
struct LiveStatus {
    status: TaskStatus,
    current_step: Option<String>,
    step_status: StepStatus,
    pending_prompt: Option<HumanPrompt>,
}

/// One supervised run of a `TaskDefinition`.
///
/// # Invariants
/// - `state` is only mutated by this execution's own control flow
/// - `run()` succeeds at most once
pub struct TaskExecution {
    definition: Arc<TaskDefinition>,
    snapshot: TaskSnapshot,
    config: TaskConfig,
    services: ExecutionServices,
    state: RwLock<TaskExecutionState>,
    live: Mutex<LiveStatus>,
    budget: BudgetHandle,
    cancel: CancellationToken,
    gate: PauseGate,
    started: AtomicBool,
    restored_from: Option<String>,
}

impl TaskExecution {
    /// Create a fresh execution.
    ///
    /// # Errors
    /// `EngineError::InvalidDefinition` if the definition is malformed.
    pub fn new(
        definition: Arc<TaskDefinition>,
        config: TaskConfig,
        services: ExecutionServices,
    ) -> Result<Self, EngineError> {
        Self::with_state(definition, config, TaskExecutionState::new(), None, services)
    }

    /// Create an execution pre-seeded with a checkpoint's state.
    ///
    /// # Errors
    /// `EngineError::DefinitionMismatch` if the checkpoint was taken from a
    /// definition with different steps.
    pub fn restore(
        definition: Arc<TaskDefinition>,
        checkpoint_id: &str,
        data: CheckpointData,
        services: ExecutionServices,
    ) -> Result<Self, EngineError> {
        if !data.task.matches(&definition) {
            return Err(EngineError::DefinitionMismatch {
                task_id: definition.id.clone(),
                checkpoint_id: checkpoint_id.to_string(),
            });
        }
        let mut state = data.state;
        state.push_checkpoint(checkpoint_id);
        Self::with_state(
            definition,
            data.config,
            state,
            Some(checkpoint_id.to_string()),
            services,
        )
    }

    fn with_state(
        definition: Arc<TaskDefinition>,
        config: TaskConfig,
        state: TaskExecutionState,
        restored_from: Option<String>,
        services: ExecutionServices,
    ) -> Result<Self, EngineError> {
        definition.validate()?;
        let budget = BudgetHandle::new(BudgetTracker::resumed(
            config.budget_limit,
            state.cost_used(),
        ));
        Ok(Self {
            snapshot: TaskSnapshot::from_definition(&definition),
            definition,
            config,
            services,
            state: RwLock::new(state),
            live: Mutex::new(LiveStatus::default()),
            budget,
            cancel: CancellationToken::new(),
            gate: PauseGate::new(),
            started: AtomicBool::new(false),
            restored_from,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &Arc<TaskDefinition> {
        &self.definition
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Checkpoint this execution was restored from.
    pub fn restored_from(&self) -> Option<&str> {
        self.restored_from.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        let live = self.live_lock().clone();
        self.effective_status(&live)
    }

    /// Request cancellation. Takes effect at the next step boundary, or
    /// immediately if the run is waiting on the pause gate, a human or a
    /// retry delay.
    ///
    /// Returns `false` if the run already finished.
    pub fn cancel(&self) -> bool {
        if self.live_lock().status.is_terminal() {
            return false;
        }
        tracing::info!(task_id = %self.task_id(), "Cancellation requested");
        self.cancel.cancel();
        true
    }

    /// Pause before the next step. Returns `false` if the run already finished.
    pub fn pause(&self) -> bool {
        if self.live_lock().status.is_terminal() {
            return false;
        }
        if self.gate.pause() {
            tracing::info!(task_id = %self.task_id(), "Task paused");
        }
        true
    }

    /// Release a pause. Returns `false` if the run already finished.
    pub fn resume(&self) -> bool {
        if self.live_lock().status.is_terminal() {
            return false;
        }
        if self.gate.resume() {
            tracing::info!(task_id = %self.task_id(), "Task resumed");
        }
        true
    }

    /// Consistent snapshot of the run.
    pub async fn progress(&self) -> TaskProgress {
        let state = self.state.read().await;
        let live = self.live_lock().clone();
        let total_steps = self.definition.steps.len();
        let index = state.current_step_index();

        TaskProgress {
            task_id: self.task_id().to_string(),
            status: self.effective_status(&live),
            total_steps,
            completed_steps: state.completed_steps().len(),
            failed_steps: state.failed_steps().len(),
            current_step_index: index,
            current_step_id: live
                .current_step
                .clone()
                .or_else(|| self.definition.steps.get(index).map(|s| s.id.clone())),
            current_step_status: live.step_status,
            elapsed_ms: state.elapsed_ms(),
            estimated_remaining_ms: state.estimate_remaining_ms(total_steps),
            cost_used: state.cost_used(),
            budget_limit: self.config.budget_limit,
            last_checkpoint: state.last_checkpoint().map(str::to_string),
            pending_prompt: live.pending_prompt,
        }
    }

    /// Copy of the current run state.
    pub async fn state_snapshot(&self) -> TaskExecutionState {
        self.state.read().await.clone()
    }

    /// Persist the current state and record the checkpoint id.
    pub async fn checkpoint(&self) -> Result<String, CheckpointError> {
        let checkpoint_id = generate_checkpoint_id(self.task_id());
        let mut state = self.state.read().await.clone();
        state.push_checkpoint(checkpoint_id.clone());
        let data = CheckpointData::new(self.snapshot.clone(), self.config.clone(), state);

        self.services.store.save(&checkpoint_id, &data).await?;
        self.state.write().await.push_checkpoint(checkpoint_id.clone());

        tracing::info!(
            task_id = %self.task_id(),
            checkpoint_id = %checkpoint_id,
            step_index = data.state.current_step_index(),
            "Checkpoint saved"
        );
        self.services.events.publish(EngineEvent::CheckpointCreated {
            task_id: self.task_id().to_string(),
            checkpoint_id: checkpoint_id.clone(),
        });
        Ok(checkpoint_id)
    }

    /// Drive the task to a terminal state.
    ///
    /// # Errors
    /// `EngineError::AlreadyStarted` on a second call. Every step-level or
    /// task-level failure is reported through the returned `TaskResult`.
    pub async fn run(&self) -> Result<TaskResult, EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted(self.task_id().to_string()));
        }
        self.live_lock().status = TaskStatus::Running;
        tracing::info!(
            task_id = %self.task_id(),
            steps = self.definition.steps.len(),
            resumed_from = self.restored_from.as_deref().unwrap_or("-"),
            "Task execution started"
        );

        let outcome = self.run_steps().await;
        let status = match &outcome {
            Ok(()) => TaskStatus::Completed,
            Err(ExecutionError::Cancelled) => TaskStatus::Cancelled,
            Err(_) => TaskStatus::Failed,
        };
        {
            let mut live = self.live_lock();
            live.status = status;
            live.pending_prompt = None;
        }

        let result = self.build_result(status, outcome.err()).await;
        match &result.error {
            None => tracing::info!(
                task_id = %self.task_id(),
                duration_ms = result.total_duration_ms,
                cost = result.total_cost,
                retries = result.total_retries,
                "Task execution completed"
            ),
            Some(error) => tracing::warn!(
                task_id = %self.task_id(),
                status = %status,
                error = %error,
                "Task execution ended without success"
            ),
        }
        self.publish_progress().await;
        Ok(result)
    }

    async fn run_steps(&self) -> Result<(), ExecutionError> {
        // Only completed steps are skipped; a restored run retries failed ones.
        for (index, step) in self.definition.steps.iter().enumerate() {
            if self.state.read().await.is_completed(&step.id) {
                self.state.write().await.advance_to(index + 1);
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            self.gate.wait(&self.cancel).await?;

            let result = self.run_step(index, step).await?;
            if !result.success && step.config.is_critical() {
                return Err(ExecutionError::CriticalStepFailed {
                    step_id: step.id.clone(),
                    reason: result.error.unwrap_or_default(),
                });
            }

            self.state.write().await.advance_to(index + 1);
            self.publish_progress().await;
        }
        Ok(())
    }

    /// Run one step through retries, verification and the confidence gate.
    ///
    /// Returns the final stored result, successful or not. Errors are
    /// task-level failures that end the run.
    async fn run_step(
        &self,
        index: usize,
        step: &StepDefinition,
    ) -> Result<StepResult, ExecutionError> {
        let max_retries = step.config.max_retries.unwrap_or(self.config.max_retries);
        let timeout = Duration::from_millis(step.config.timeout_ms.unwrap_or(self.config.timeout_ms));
        let threshold = step
            .config
            .confidence_threshold
            .unwrap_or(self.config.confidence_threshold);

        let mut attempt: u32 = 0;
        let mut executions: u32 = 0;
        let mut last_error = String::new();

        while attempt <= max_retries {
            if attempt > 0 {
                self.backoff(step, attempt, &last_error).await?;
            }
            executions += 1;

            let result = match self.attempt(index, step, attempt, timeout).await {
                Ok(result) => result,
                Err(error) => {
                    tracing::warn!(
                        task_id = %self.task_id(),
                        step_id = %step.id,
                        attempt,
                        error = %error,
                        "Step attempt failed"
                    );
                    last_error = error;
                    attempt += 1;
                    continue;
                }
            };

            let low_confidence = result.confidence_percent() < threshold;
            if low_confidence || self.config.require_human_approval {
                match self.confirm(index, step, &result, threshold, low_confidence).await? {
                    ConfirmationDecision::Accept => {}
                    ConfirmationDecision::Retry => {
                        self.state.write().await.record_retry(&step.id);
                        last_error = "Retry requested by reviewer".to_string();
                        self.services.events.publish(EngineEvent::StepRetry {
                            task_id: self.task_id().to_string(),
                            step_id: step.id.clone(),
                            attempt: 0,
                            delay_ms: 0,
                            error: last_error.clone(),
                        });
                        attempt = 0;
                        continue;
                    }
                    ConfirmationDecision::Reject => {
                        self.set_step(&step.id, StepStatus::Failed);
                        return Err(ExecutionError::ConfidenceRejected {
                            step_id: step.id.clone(),
                        });
                    }
                }
            }

            self.complete_step(index, step, &result).await?;
            return Ok(result);
        }

        Ok(self.fail_step(index, step, executions, last_error).await)
    }

    /// One execute + verify pass. `Err` carries the reason the attempt failed.
    async fn attempt(
        &self,
        index: usize,
        step: &StepDefinition,
        attempt: u32,
        timeout: Duration,
    ) -> Result<StepResult, String> {
        self.set_step(&step.id, StepStatus::Running);
        tracing::debug!(task_id = %self.task_id(), step_id = %step.id, attempt, "Executing step");
        self.services.events.publish(EngineEvent::StepStarted {
            task_id: self.task_id().to_string(),
            step_id: step.id.clone(),
            step_index: index,
            attempt,
        });

        let ctx = self.step_context(index, step, attempt).await;
        let started = Instant::now();
        let execute = Arc::clone(&step.execute);
        let exec_ctx = ctx.clone();
        let mut result = bounded(async move { execute.execute(exec_ctx).await }, timeout, "Step")
            .await?;
        if !result.success {
            return Err(result
                .error
                .unwrap_or_else(|| "Step reported failure".to_string()));
        }
        result.step_id = step.id.clone();
        result.duration_ms = started.elapsed().as_millis() as u64;

        if let Some(verify) = &step.verify {
            self.set_step(&step.id, StepStatus::Verifying);
            let verify = Arc::clone(verify);
            let candidate = result.clone();
            let verification = bounded(
                async move { verify.verify(candidate, ctx).await },
                timeout,
                "Verification",
            )
            .await?;

            self.services.events.publish(EngineEvent::StepVerification {
                task_id: self.task_id().to_string(),
                step_id: step.id.clone(),
                verified: verification.verified(),
                confidence: verification.confidence(),
                suggestions: verification.suggestions().to_vec(),
            });
            if !verification.verified() {
                return Err(verification.failure_reason());
            }
        }

        Ok(result)
    }

    async fn backoff(
        &self,
        step: &StepDefinition,
        attempt: u32,
        last_error: &str,
    ) -> Result<(), ExecutionError> {
        self.state.write().await.record_retry(&step.id);
        self.set_step(&step.id, StepStatus::Retrying);

        let delay = backoff_delay(self.config.retry_strategy, attempt);
        tracing::info!(
            task_id = %self.task_id(),
            step_id = %step.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying step"
        );
        self.services.events.publish(EngineEvent::StepRetry {
            task_id: self.task_id().to_string(),
            step_id: step.id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: last_error.to_string(),
        });

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn confirm(
        &self,
        index: usize,
        step: &StepDefinition,
        result: &StepResult,
        threshold: f64,
        low_confidence: bool,
    ) -> Result<ConfirmationDecision, ExecutionError> {
        let (prompt_type, priority, title) = if low_confidence {
            (
                PromptType::Confirmation,
                PromptPriority::High,
                format!("Low confidence on step '{}'", step.name),
            )
        } else {
            (
                PromptType::Approval,
                PromptPriority::Normal,
                format!("Approve step '{}'", step.name),
            )
        };
        let message = format!(
            "Step '{}' finished with confidence {:.0}% (threshold {:.0}%). Accept, retry or reject the result?",
            step.name,
            result.confidence_percent(),
            threshold
        );
        let prompt = HumanPrompt::new(prompt_type, title, message)
            .with_task(self.task_id(), &step.id)
            .with_priority(priority)
            .with_options(ConfirmationDecision::OPTIONS)
            .with_context(serde_json::json!({
                "step_index": index,
                "confidence": result.confidence,
                "threshold": threshold,
                "data": result.data,
            }))
            .with_timeout(self.config.human_timeout());

        {
            let mut live = self.live_lock();
            live.step_status = StepStatus::AwaitingHuman;
            live.pending_prompt = Some(prompt.clone());
        }
        self.publish_progress().await;

        let response = self
            .services
            .broker
            .request(prompt, Some(&self.cancel))
            .await;
        self.live_lock().pending_prompt = None;

        match response {
            Ok(response) => match response.decision() {
                Some(decision) => {
                    tracing::info!(
                        task_id = %self.task_id(),
                        step_id = %step.id,
                        decision = decision.as_str(),
                        "Reviewer decided"
                    );
                    Ok(decision)
                }
                None => {
                    tracing::warn!(
                        task_id = %self.task_id(),
                        step_id = %step.id,
                        choice = response.choice.as_deref().unwrap_or("-"),
                        "Unrecognized reviewer choice, treating as reject"
                    );
                    Ok(ConfirmationDecision::Reject)
                }
            },
            Err(HumanInputError::Cancelled(_)) => Err(ExecutionError::Cancelled),
            Err(e) => {
                tracing::warn!(task_id = %self.task_id(), step_id = %step.id, error = %e, "No reviewer decision");
                Err(ExecutionError::HumanTimeout {
                    step_id: step.id.clone(),
                })
            }
        }
    }

    async fn complete_step(
        &self,
        index: usize,
        step: &StepDefinition,
        result: &StepResult,
    ) -> Result<(), ExecutionError> {
        let model = result
            .model
            .as_deref()
            .unwrap_or(&self.services.default_model);
        let cost = cost_for_tokens(result.tokens_used, model);
        {
            let mut state = self.state.write().await;
            state.record_success(result.clone());
            state.add_cost(cost);
            state.advance_to(index + 1);
        }
        self.set_step(&step.id, StepStatus::Completed);

        tracing::info!(
            task_id = %self.task_id(),
            step_id = %step.id,
            duration_ms = result.duration_ms,
            tokens = result.tokens_used,
            cost,
            "Step completed"
        );
        self.services.events.publish(EngineEvent::StepCompleted {
            task_id: self.task_id().to_string(),
            step_id: step.id.clone(),
            duration_ms: result.duration_ms,
            confidence: result.confidence,
            tokens_used: result.tokens_used,
        });

        match self.budget.add(cost) {
            BudgetCheck::Ok => {}
            BudgetCheck::Warning { used, limit } => {
                tracing::warn!(task_id = %self.task_id(), used, limit, "Budget 80% consumed");
                self.services.events.publish(EngineEvent::BudgetWarning {
                    task_id: self.task_id().to_string(),
                    used,
                    limit,
                });
            }
            BudgetCheck::Exceeded { used, limit } => {
                tracing::error!(task_id = %self.task_id(), used, limit, "Budget exceeded");
                self.services.events.publish(EngineEvent::BudgetExceeded {
                    task_id: self.task_id().to_string(),
                    used,
                    limit,
                });
                return Err(ExecutionError::BudgetExceeded { used, limit });
            }
        }

        if self.config.checkpoint_frequency != CheckpointFrequency::Manual {
            self.auto_checkpoint().await;
        }
        Ok(())
    }

    async fn fail_step(
        &self,
        index: usize,
        step: &StepDefinition,
        executions: u32,
        last_error: String,
    ) -> StepResult {
        let critical = step.config.is_critical();
        tracing::error!(
            task_id = %self.task_id(),
            step_id = %step.id,
            attempts = executions,
            critical,
            error = %last_error,
            "Step failed after exhausting retries"
        );
        self.services.events.publish(EngineEvent::StepFailed {
            task_id: self.task_id().to_string(),
            step_id: step.id.clone(),
            error: last_error.clone(),
            attempts: executions,
            critical,
        });

        if let Some(rollback) = &step.rollback {
            let rollback = Arc::clone(rollback);
            let ctx = self.step_context(index, step, executions).await;
            let timeout =
                Duration::from_millis(step.config.timeout_ms.unwrap_or(self.config.timeout_ms));
            match bounded(async move { rollback.rollback(ctx).await }, timeout, "Rollback").await {
                Ok(()) => tracing::info!(task_id = %self.task_id(), step_id = %step.id, "Rollback completed"),
                Err(e) => tracing::warn!(task_id = %self.task_id(), step_id = %step.id, error = %e, "Rollback failed"),
            }
        }

        let mut failed = StepResult::failure(last_error);
        failed.step_id = step.id.clone();
        {
            let mut state = self.state.write().await;
            state.record_failure(failed.clone());
            // The cursor never moves past a critical failure.
            if !critical {
                state.advance_to(index + 1);
            }
        }
        self.set_step(&step.id, StepStatus::Failed);

        if self.config.checkpoint_frequency == CheckpointFrequency::EveryStep {
            self.auto_checkpoint().await;
        }
        failed
    }

    async fn auto_checkpoint(&self) {
        if let Err(e) = self.checkpoint().await {
            tracing::warn!(task_id = %self.task_id(), error = %e, "Automatic checkpoint failed");
        }
    }

    async fn step_context(&self, index: usize, step: &StepDefinition, attempt: u32) -> StepContext {
        let previous: HashMap<String, StepResult> = self
            .state
            .read()
            .await
            .results()
            .iter()
            .filter(|(_, r)| r.success)
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();

        StepContext {
            task_id: self.task_id().to_string(),
            step_id: step.id.clone(),
            step_index: index,
            attempt,
            previous_results: Arc::new(previous),
            memory: Arc::clone(&self.services.memory),
            budget: self.budget.clone(),
            cancellation: self.cancel.child_token(),
        }
    }

    async fn build_result(&self, status: TaskStatus, error: Option<ExecutionError>) -> TaskResult {
        let state = self.state.read().await;
        TaskResult {
            task_id: self.task_id().to_string(),
            success: status == TaskStatus::Completed,
            status,
            results: self
                .definition
                .steps
                .iter()
                .filter_map(|s| state.result(&s.id).cloned())
                .collect(),
            total_duration_ms: state.elapsed_ms(),
            total_cost: state.cost_used(),
            total_retries: state.total_retries(),
            checkpoints: state.checkpoints().to_vec(),
            error: error.map(|e| e.to_string()),
        }
    }

    async fn publish_progress(&self) {
        let progress = self.progress().await;
        self.services
            .events
            .publish(EngineEvent::TaskProgress { progress });
    }

    fn set_step(&self, step_id: &str, status: StepStatus) {
        let mut live = self.live_lock();
        live.current_step = Some(step_id.to_string());
        live.step_status = status;
    }

    fn effective_status(&self, live: &LiveStatus) -> TaskStatus {
        if live.status.is_terminal() {
            live.status
        } else if self.gate.is_paused() {
            TaskStatus::Paused
        } else if live.pending_prompt.is_some() {
            TaskStatus::AwaitingHuman
        } else {
            live.status
        }
    }

    fn live_lock(&self) -> MutexGuard<'_, LiveStatus> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run a caller-supplied operation on its own task, bounded by `timeout`.
///
/// On timeout the engine stops waiting; the operation keeps running in the
/// background unless it watches its cancellation token.
async fn bounded<T, F>(operation: F, timeout: Duration, label: &str) -> Result<T, String>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(operation);
    match tokio::time::timeout(timeout, handle).await {
        Err(_) => Err(format!("{} timed out after {}ms", label, timeout.as_millis())),
        Ok(Err(join_error)) => Err(format!("{} panicked: {}", label, join_error)),
        Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{test_support, InMemoryCheckpointStore};
    use crate::memory::InMemoryMemory;
    use crate::task::VerificationResult;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn services() -> ExecutionServices {
        let events = EventBus::new(256);
        ExecutionServices {
            broker: Arc::new(HumanPromptBroker::new(events.clone())),
            store: Arc::new(InMemoryCheckpointStore::new()),
            memory: Arc::new(InMemoryMemory::new()),
            events,
            default_model: "claude-sonnet-4".to_string(),
        }
    }

    fn ok_step(id: &str) -> StepDefinition {
        let value = id.to_string();
        StepDefinition::new(id, move |_ctx: StepContext| {
            let value = value.clone();
            async move { anyhow::Ok(StepResult::success(json!(value))) }
        })
    }

    fn counting_step(id: &str, calls: Arc<AtomicU32>) -> StepDefinition {
        StepDefinition::new(id, move |_ctx: StepContext| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(StepResult::success(json!(null)))
            }
        })
    }

    fn execution(definition: TaskDefinition) -> TaskExecution {
        TaskExecution::new(Arc::new(definition), TaskConfig::default(), services()).unwrap()
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let exec = execution(TaskDefinition::new("t", "Twice").with_step(ok_step("a")));

        let result = exec.run().await.unwrap();
        assert!(result.success);
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(exec.status(), TaskStatus::Completed);
        assert!(matches!(exec.run().await, Err(EngineError::AlreadyStarted(_))));
        assert!(!exec.cancel());
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let result = TaskExecution::new(
            Arc::new(TaskDefinition::new("empty", "No steps")),
            TaskConfig::default(),
            services(),
        );
        assert!(matches!(result, Err(EngineError::InvalidDefinition(_))));
    }

    #[tokio::test]
    async fn test_later_steps_see_earlier_results() {
        let reader = StepDefinition::new("b", |ctx: StepContext| async move {
            let upstream = ctx
                .previous("a")
                .map(|r| r.data.clone())
                .unwrap_or_default();
            anyhow::Ok(StepResult::success(json!({ "saw": upstream })))
        });
        let exec = execution(
            TaskDefinition::new("t", "Chain")
                .with_step(ok_step("a"))
                .with_step(reader),
        );

        let result = exec.run().await.unwrap();
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.results[0].step_id, "a");
        assert_eq!(result.result("b").unwrap().data, json!({ "saw": "a" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let slow = StepDefinition::new("slow", |_ctx: StepContext| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            anyhow::Ok(StepResult::success(json!(null)))
        })
        .with_timeout(Duration::from_secs(1))
        .with_max_retries(1)
        .non_critical();
        let exec = execution(
            TaskDefinition::new("t", "Slow")
                .with_step(slow)
                .with_step(ok_step("after")),
        );

        let result = exec.run().await.unwrap();
        assert!(result.success);
        assert_eq!(result.total_retries, 1);
        let failed = result.result("slow").unwrap();
        assert!(!failed.success);
        assert!(failed.error.as_deref().unwrap().contains("timed out"));
        assert!(result.result("after").unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_verification_retries_then_rolls_back() {
        let rollbacks = Arc::new(AtomicU32::new(0));
        let calls = Arc::new(AtomicU32::new(0));
        let step = counting_step("checked", Arc::clone(&calls))
            .with_verify(|_result: StepResult, _ctx: StepContext| async move {
                anyhow::Ok(VerificationResult::fail(0.2).with_suggestion("check the output format"))
            })
            .with_rollback({
                let rollbacks = Arc::clone(&rollbacks);
                move |_ctx: StepContext| {
                    let rollbacks = Arc::clone(&rollbacks);
                    async move {
                        rollbacks.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(())
                    }
                }
            })
            .with_max_retries(1);
        let exec = execution(
            TaskDefinition::new("t", "Verified")
                .with_step(step)
                .with_step(ok_step("never")),
        );

        let result = exec.run().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("checked"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        assert!(result.result("never").is_none());
    }

    #[tokio::test]
    async fn test_panicking_step_is_a_failed_attempt() {
        let step = StepDefinition::new("boom", |_ctx: StepContext| async move {
            if true {
                panic!("step exploded");
            }
            anyhow::Ok(StepResult::success(json!(null)))
        })
        .with_max_retries(0)
        .non_critical();
        let exec = execution(TaskDefinition::new("t", "Panics").with_step(step));

        let result = exec.run().await.unwrap();
        assert!(result.success);
        let failed = result.result("boom").unwrap();
        assert!(failed.error.as_deref().unwrap().contains("panicked"));
        assert_eq!(exec.progress().await.failed_steps, 1);
    }

    #[tokio::test]
    async fn test_restore_rejects_changed_definition() {
        let data = test_support::sample("t", &["a", "b"], 1);
        let definition = TaskDefinition::new("t", "Changed")
            .with_step(ok_step("a"))
            .with_step(ok_step("c"));

        let result = TaskExecution::restore(Arc::new(definition), "cp-t-1", data, services());
        assert!(matches!(result, Err(EngineError::DefinitionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_restore_skips_completed_steps() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let definition = TaskDefinition::new("t", "Resumed")
            .with_step(counting_step("a", Arc::clone(&first)))
            .with_step(counting_step("b", Arc::clone(&second)));
        let data = test_support::sample("t", &["a", "b"], 1);

        let exec =
            TaskExecution::restore(Arc::new(definition), "cp-t-1", data, services()).unwrap();
        assert_eq!(exec.restored_from(), Some("cp-t-1"));

        let result = exec.run().await.unwrap();
        assert!(result.success);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.checkpoints.first().map(String::as_str), Some("cp-t-1"));
        assert!(result.total_cost >= 0.25);
    }

    fn always_failing(id: &str, calls: Arc<AtomicU32>) -> StepDefinition {
        StepDefinition::new(id, move |_ctx: StepContext| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<StepResult, _>(anyhow::anyhow!("still broken"))
            }
        })
        .with_max_retries(0)
    }

    #[tokio::test]
    async fn test_critical_failure_is_not_skipped_on_restore() {
        let calls = Arc::new(AtomicU32::new(0));
        let definition = Arc::new(
            TaskDefinition::new("t", "Critical")
                .with_step(ok_step("a"))
                .with_step(always_failing("critical", Arc::clone(&calls))),
        );
        let config = TaskConfig {
            checkpoint_frequency: CheckpointFrequency::EveryStep,
            ..TaskConfig::default()
        };
        let svc = services();
        let store = Arc::clone(&svc.store);

        let exec = TaskExecution::new(Arc::clone(&definition), config, svc).unwrap();
        let first = exec.run().await.unwrap();
        assert_eq!(first.status, TaskStatus::Failed);
        assert_eq!(exec.state_snapshot().await.current_step_index(), 1);

        let checkpoint_id = first.checkpoints.last().cloned().unwrap();
        let data = store.load(&checkpoint_id).await.unwrap().unwrap();
        assert_eq!(data.state.current_step_index(), 1);
        assert!(data.state.failed_steps().contains("critical"));

        let resumed = TaskExecution::restore(definition, &checkpoint_id, data, services())
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(resumed.status, TaskStatus::Failed);
        assert!(!resumed.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restore_reruns_failed_step_behind_cursor() {
        let calls = Arc::new(AtomicU32::new(0));
        let definition = TaskDefinition::new("t", "Behind")
            .with_step(ok_step("a"))
            .with_step(counting_step("b", Arc::clone(&calls)));
        let mut data = test_support::sample("t", &["a", "b"], 1);
        let mut failed = StepResult::failure("earlier crash");
        failed.step_id = "b".to_string();
        data.state.record_failure(failed);
        data.state.advance_to(2);

        let result = TaskExecution::restore(Arc::new(definition), "cp-t-1", data, services())
            .unwrap()
            .run()
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.result("b").unwrap().success);
    }

    #[tokio::test]
    async fn test_manual_checkpoint_is_persisted() {
        let svc = services();
        let store = Arc::clone(&svc.store);
        let exec = TaskExecution::new(
            Arc::new(TaskDefinition::new("t", "Manual").with_step(ok_step("a"))),
            TaskConfig {
                checkpoint_frequency: CheckpointFrequency::Manual,
                ..TaskConfig::default()
            },
            svc,
        )
        .unwrap();

        let result = exec.run().await.unwrap();
        assert!(result.checkpoints.is_empty());

        let checkpoint_id = exec.checkpoint().await.unwrap();
        let saved = store.load(&checkpoint_id).await.unwrap().unwrap();
        assert!(saved.state.is_completed("a"));
        assert_eq!(saved.state.last_checkpoint(), Some(checkpoint_id.as_str()));
    }
}
