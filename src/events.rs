//! Engine events and the broadcast bus that carries them.
//!
//! The vocabulary is fixed; dashboards and streaming transports subscribe
//! through `EventBus::subscribe` and receive every event published after the
//! subscription. Slow subscribers lag rather than block the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::human::{HumanPrompt, HumanResponse};
use crate::task::TaskProgress;

/// Default capacity of the broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A structured event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskStarted {
        task_id: String,
        name: String,
        total_steps: usize,
        /// Checkpoint the run was restored from
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resumed_from: Option<String>,
    },
    TaskProgress {
        progress: TaskProgress,
    },
    TaskCompleted {
        task_id: String,
        duration_ms: u64,
        total_cost: f64,
        total_retries: u32,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskCancelled {
        task_id: String,
    },
    StepStarted {
        task_id: String,
        step_id: String,
        step_index: usize,
        attempt: u32,
    },
    StepCompleted {
        task_id: String,
        step_id: String,
        duration_ms: u64,
        confidence: f64,
        tokens_used: u64,
    },
    StepFailed {
        task_id: String,
        step_id: String,
        error: String,
        attempts: u32,
        critical: bool,
    },
    StepRetry {
        task_id: String,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepVerification {
        task_id: String,
        step_id: String,
        verified: bool,
        confidence: f64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        suggestions: Vec<String>,
    },
    HumanPrompt {
        prompt: HumanPrompt,
    },
    HumanResponse {
        response: HumanResponse,
    },
    HumanTimeout {
        prompt_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    CheckpointCreated {
        task_id: String,
        checkpoint_id: String,
    },
    CheckpointRestored {
        task_id: String,
        checkpoint_id: String,
    },
    BudgetWarning {
        task_id: String,
        used: f64,
        limit: f64,
    },
    BudgetExceeded {
        task_id: String,
        used: f64,
        limit: f64,
    },
}

impl EngineEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            EngineEvent::TaskStarted { .. } => "task_started",
            EngineEvent::TaskProgress { .. } => "task_progress",
            EngineEvent::TaskCompleted { .. } => "task_completed",
            EngineEvent::TaskFailed { .. } => "task_failed",
            EngineEvent::TaskCancelled { .. } => "task_cancelled",
            EngineEvent::StepStarted { .. } => "step_started",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::StepFailed { .. } => "step_failed",
            EngineEvent::StepRetry { .. } => "step_retry",
            EngineEvent::StepVerification { .. } => "step_verification",
            EngineEvent::HumanPrompt { .. } => "human_prompt",
            EngineEvent::HumanResponse { .. } => "human_response",
            EngineEvent::HumanTimeout { .. } => "human_timeout",
            EngineEvent::CheckpointCreated { .. } => "checkpoint_created",
            EngineEvent::CheckpointRestored { .. } => "checkpoint_restored",
            EngineEvent::BudgetWarning { .. } => "budget_warning",
            EngineEvent::BudgetExceeded { .. } => "budget_exceeded",
        }
    }

    /// Task the event belongs to, when it has one.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            EngineEvent::TaskStarted { task_id, .. }
            | EngineEvent::TaskCompleted { task_id, .. }
            | EngineEvent::TaskFailed { task_id, .. }
            | EngineEvent::TaskCancelled { task_id }
            | EngineEvent::StepStarted { task_id, .. }
            | EngineEvent::StepCompleted { task_id, .. }
            | EngineEvent::StepFailed { task_id, .. }
            | EngineEvent::StepRetry { task_id, .. }
            | EngineEvent::StepVerification { task_id, .. }
            | EngineEvent::CheckpointCreated { task_id, .. }
            | EngineEvent::CheckpointRestored { task_id, .. }
            | EngineEvent::BudgetWarning { task_id, .. }
            | EngineEvent::BudgetExceeded { task_id, .. } => Some(task_id),
            EngineEvent::TaskProgress { progress } => Some(&progress.task_id),
            EngineEvent::HumanPrompt { prompt } => prompt.task_id.as_deref(),
            EngineEvent::HumanTimeout { task_id, .. } => task_id.as_deref(),
            EngineEvent::HumanResponse { .. } => None,
        }
    }
}

/// Publish side of the event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event = event.event_name(), "Publishing engine event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = EngineEvent::StepRetry {
            task_id: "t1".to_string(),
            step_id: "fetch".to_string(),
            attempt: 2,
            delay_ms: 2000,
            error: "timeout".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_retry");
        assert_eq!(json["delay_ms"], 2000);
        assert_eq!(event.event_name(), "step_retry");
        assert_eq!(event.task_id(), Some("t1"));
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(EngineEvent::TaskCancelled {
            task_id: "early".to_string(),
        });

        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::TaskCancelled {
            task_id: "t1".to_string(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::TaskCancelled { task_id } => assert_eq!(task_id, "t1"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
