//! Reliability orchestrator - the public face of the engine.
//!
//! Owns the set of in-flight executions, the definition registry used for
//! resumption, the human prompt broker and the event bus. Construct one per
//! service and share it behind an `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::broadcast;

use crate::checkpoint::{
    create_checkpoint_store, generate_checkpoint_id, CheckpointData, CheckpointStore,
    CheckpointSummary, InMemoryCheckpointStore, TaskSnapshot,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::execution::{ExecutionServices, TaskExecution};
use crate::human::{HumanPrompt, HumanPromptBroker, HumanResponse};
use crate::memory::{InMemoryMemory, MemoryAccessor};
use crate::task::{TaskDefinition, TaskExecutionState, TaskProgress, TaskResult, TaskStatus};

type ExecutionMap = Arc<Mutex<HashMap<String, Arc<TaskExecution>>>>;

/// Removes an execution from the in-flight map however `drive` exits.
struct Registration {
    executions: ExecutionMap,
    task_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.executions).remove(&self.task_id);
    }
}

fn lock(executions: &ExecutionMap) -> MutexGuard<'_, HashMap<String, Arc<TaskExecution>>> {
    executions.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ReliabilityOrchestrator {
    config: EngineConfig,
    services: ExecutionServices,
    executions: ExecutionMap,
    definitions: RwLock<HashMap<String, Arc<TaskDefinition>>>,
}

impl ReliabilityOrchestrator {
    /// Orchestrator with in-memory checkpoints and memory.
    pub fn new(config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let services = ExecutionServices {
            broker: Arc::new(HumanPromptBroker::new(events.clone())),
            store: Arc::new(InMemoryCheckpointStore::new()),
            memory: Arc::new(InMemoryMemory::new()),
            events,
            default_model: config.default_model.clone(),
        };
        Self {
            config,
            services,
            executions: Arc::new(Mutex::new(HashMap::new())),
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Orchestrator with the checkpoint backend named in `config`.
    pub async fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let store =
            create_checkpoint_store(config.checkpoint_store, config.checkpoint_dir.clone()).await?;
        tracing::info!(
            backend = ?config.checkpoint_store,
            persistent = store.is_persistent(),
            "Checkpoint store ready"
        );
        Ok(Self::new(config).with_checkpoint_store(store))
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.services.store = store;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryAccessor>) -> Self {
        self.services.memory = memory;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive every engine event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.services.events.subscribe()
    }

    /// Remember a definition so its checkpoints can be resumed later.
    ///
    /// Replaces any definition previously registered under the same id.
    pub fn register_definition(&self, definition: TaskDefinition) -> Result<(), EngineError> {
        definition.validate()?;
        self.remember(Arc::new(definition));
        Ok(())
    }

    /// Run a task to completion.
    ///
    /// # Errors
    /// - `InvalidDefinition` for a malformed definition
    /// - `TaskAlreadyRunning` if a task with the same id is in flight
    ///
    /// Step and task failures are reported in the returned `TaskResult`.
    pub async fn execute_task(&self, definition: TaskDefinition) -> Result<TaskResult, EngineError> {
        definition.validate()?;
        let config = self.config.task_defaults.merged(&definition.config);
        let definition = Arc::new(definition);
        let execution =
            TaskExecution::new(Arc::clone(&definition), config, self.services.clone())?;
        self.drive(execution).await
    }

    /// Continue a task from a stored checkpoint, skipping completed steps.
    ///
    /// The task's definition must have been executed or registered on this
    /// orchestrator, since step callables are not persisted.
    pub async fn resume_from_checkpoint(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> Result<TaskResult, EngineError> {
        let data = self
            .services
            .store
            .load(checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::CheckpointNotFound(checkpoint_id.to_string()))?;
        if data.task_id() != task_id {
            return Err(EngineError::DefinitionMismatch {
                task_id: task_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            });
        }
        let definition = self
            .definition(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        let execution =
            TaskExecution::restore(definition, checkpoint_id, data, self.services.clone())?;
        tracing::info!(task_id = %task_id, checkpoint_id = %checkpoint_id, "Restoring task from checkpoint");
        self.services.events.publish(EngineEvent::CheckpointRestored {
            task_id: task_id.to_string(),
            checkpoint_id: checkpoint_id.to_string(),
        });
        self.drive(execution).await
    }

    /// Returns `false` if no such task is running.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.execution(task_id).is_some_and(|e| e.cancel())
    }

    /// Returns `false` if no such task is running.
    pub fn pause_task(&self, task_id: &str) -> bool {
        self.execution(task_id).is_some_and(|e| e.pause())
    }

    /// Returns `false` if no such task is running.
    pub fn resume_task(&self, task_id: &str) -> bool {
        self.execution(task_id).is_some_and(|e| e.resume())
    }

    pub async fn get_task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        let execution = self.execution(task_id)?;
        Some(execution.progress().await)
    }

    /// Ids of the tasks currently in flight.
    pub fn running_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.executions).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Publish `prompt` and wait for the matching `provide_human_response`.
    ///
    /// # Errors
    /// `EngineError::HumanInput` on timeout or a duplicate prompt id.
    pub async fn request_human_input(&self, prompt: HumanPrompt) -> Result<HumanResponse, EngineError> {
        Ok(self.services.broker.request(prompt, None).await?)
    }

    /// Resolve a pending prompt. Late or duplicate responses are ignored and
    /// return `false`.
    pub async fn provide_human_response(&self, response: HumanResponse) -> bool {
        self.services.broker.respond(response).await
    }

    pub async fn pending_prompts(&self) -> Vec<HumanPrompt> {
        self.services.broker.pending_prompts().await
    }

    /// Persist `state` for a known task and return the new checkpoint id.
    pub async fn save_checkpoint(
        &self,
        task_id: &str,
        state: &TaskExecutionState,
    ) -> Result<String, EngineError> {
        let definition = self
            .definition(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let config = self.config.task_defaults.merged(&definition.config);

        let checkpoint_id = generate_checkpoint_id(task_id);
        let mut state = state.clone();
        state.push_checkpoint(checkpoint_id.clone());
        let data = CheckpointData::new(TaskSnapshot::from_definition(&definition), config, state);
        self.services.store.save(&checkpoint_id, &data).await?;

        tracing::info!(task_id = %task_id, checkpoint_id = %checkpoint_id, "Checkpoint saved");
        self.services.events.publish(EngineEvent::CheckpointCreated {
            task_id: task_id.to_string(),
            checkpoint_id: checkpoint_id.clone(),
        });
        Ok(checkpoint_id)
    }

    /// Snapshot a running task's current state.
    pub async fn checkpoint_task(&self, task_id: &str) -> Result<String, EngineError> {
        let execution = self
            .execution(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        Ok(execution.checkpoint().await?)
    }

    /// Checkpoints of a task, oldest first.
    pub async fn list_checkpoints(&self, task_id: &str) -> Result<Vec<CheckpointSummary>, EngineError> {
        Ok(self.services.store.list(task_id).await?)
    }

    async fn drive(&self, execution: TaskExecution) -> Result<TaskResult, EngineError> {
        let execution = Arc::new(execution);
        let task_id = execution.task_id().to_string();
        let _registration = self.claim(&execution)?;
        self.remember(Arc::clone(execution.definition()));

        self.services.events.publish(EngineEvent::TaskStarted {
            task_id: task_id.clone(),
            name: execution.definition().name.clone(),
            total_steps: execution.definition().steps.len(),
            resumed_from: execution.restored_from().map(str::to_string),
        });

        let result = execution.run().await?;
        let event = match result.status {
            TaskStatus::Completed => EngineEvent::TaskCompleted {
                task_id,
                duration_ms: result.total_duration_ms,
                total_cost: result.total_cost,
                total_retries: result.total_retries,
            },
            TaskStatus::Cancelled => EngineEvent::TaskCancelled { task_id },
            _ => EngineEvent::TaskFailed {
                task_id,
                error: result.error.clone().unwrap_or_default(),
            },
        };
        self.services.events.publish(event);
        Ok(result)
    }

    fn claim(&self, execution: &Arc<TaskExecution>) -> Result<Registration, EngineError> {
        let task_id = execution.task_id().to_string();
        let mut executions = lock(&self.executions);
        if executions.contains_key(&task_id) {
            return Err(EngineError::TaskAlreadyRunning(task_id));
        }
        executions.insert(task_id.clone(), Arc::clone(execution));
        Ok(Registration {
            executions: Arc::clone(&self.executions),
            task_id,
        })
    }

    fn execution(&self, task_id: &str) -> Option<Arc<TaskExecution>> {
        lock(&self.executions).get(task_id).cloned()
    }

    fn definition(&self, task_id: &str) -> Option<Arc<TaskDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }

    fn remember(&self, definition: Arc<TaskDefinition>) {
        self.definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.id.clone(), definition);
    }
}

impl Default for ReliabilityOrchestrator {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
