//! Human-in-the-loop prompts and the broker that matches responses to them.
//!
//! A waiting step registers a one-shot slot keyed by prompt id, then races it
//! against the prompt timeout and the task's cancellation. Whichever fires
//! first wins; the slot is removed on every exit path, so a late or duplicate
//! response finds nothing and is ignored.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::HumanInputError;
use crate::events::{EngineEvent, EventBus};

/// Default timeout for confirmation prompts.
pub const DEFAULT_HUMAN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    /// Low-confidence result needs a decision
    Confirmation,
    /// Every result needs sign-off
    Approval,
    /// Free-form input requested
    Input,
    /// Pick one of `options`
    Choice,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A question put to a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanPrompt {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub prompt_type: PromptType,
    #[serde(default)]
    pub priority: PromptPriority,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default)]
    pub context: serde_json::Value,
    /// `None` waits indefinitely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl HumanPrompt {
    pub fn new(
        prompt_type: PromptType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: None,
            step_id: None,
            prompt_type,
            priority: PromptPriority::Normal,
            title: title.into(),
            message: message.into(),
            options: Vec::new(),
            context: serde_json::Value::Null,
            timeout_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_priority(mut self, priority: PromptPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A human's answer to a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanResponse {
    pub prompt_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    pub responded_at: DateTime<Utc>,
}

impl HumanResponse {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            choice: None,
            input: None,
            responded_at: Utc::now(),
        }
    }

    pub fn with_choice(mut self, choice: impl Into<String>) -> Self {
        self.choice = Some(choice.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Interpret `choice` as a confirmation decision.
    pub fn decision(&self) -> Option<ConfirmationDecision> {
        self.choice.as_deref().and_then(ConfirmationDecision::parse)
    }
}

/// Options offered on confirmation and approval prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationDecision {
    Accept,
    Retry,
    Reject,
}

impl ConfirmationDecision {
    pub const OPTIONS: [&'static str; 3] = ["accept", "retry", "reject"];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "accept" | "approve" | "yes" => Some(Self::Accept),
            "retry" => Some(Self::Retry),
            "reject" | "deny" | "no" => Some(Self::Reject),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Retry => "retry",
            Self::Reject => "reject",
        }
    }
}

struct PendingPrompt {
    prompt: HumanPrompt,
    tx: oneshot::Sender<HumanResponse>,
}

type PendingMap = HashMap<String, PendingPrompt>;

/// Pending-response table shared by every task of an orchestrator.
pub struct HumanPromptBroker {
    pending: Mutex<PendingMap>,
    events: EventBus,
}

/// Frees a prompt's slot when its waiter is dropped mid-wait.
struct PendingSlot<'a> {
    broker: &'a HumanPromptBroker,
    prompt_id: String,
    armed: bool,
}

impl PendingSlot<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed && self.broker.lock().remove(&self.prompt_id).is_some() {
            tracing::debug!(prompt_id = %self.prompt_id, "Waiter dropped, prompt withdrawn");
        }
    }
}

impl HumanPromptBroker {
    pub fn new(events: EventBus) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Publish `prompt` and wait for its response.
    ///
    /// # Errors
    /// - `Timeout` when `prompt.timeout_ms` elapses first
    /// - `Cancelled` when `cancel` fires first
    /// - `DuplicatePrompt` when a prompt with the same id is already waiting
    pub async fn request(
        &self,
        prompt: HumanPrompt,
        cancel: Option<&CancellationToken>,
    ) -> Result<HumanResponse, HumanInputError> {
        let prompt_id = prompt.id.clone();
        let timeout = prompt.timeout();
        let rx = {
            let mut pending = self.lock();
            if pending.contains_key(&prompt_id) {
                return Err(HumanInputError::DuplicatePrompt(prompt_id));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(
                prompt_id.clone(),
                PendingPrompt {
                    prompt: prompt.clone(),
                    tx,
                },
            );
            rx
        };

        tracing::info!(
            prompt_id = %prompt_id,
            task_id = prompt.task_id.as_deref().unwrap_or("-"),
            prompt_type = ?prompt.prompt_type,
            "Waiting for human response"
        );
        let task_id = prompt.task_id.clone();
        self.events.publish(EngineEvent::HumanPrompt { prompt });

        let expiry = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut slot = PendingSlot {
            broker: self,
            prompt_id: prompt_id.clone(),
            armed: true,
        };

        // A response that already arrived wins over an expiry in the same poll.
        let outcome = tokio::select! {
            biased;
            response = rx => {
                response.map_err(|_| HumanInputError::Dropped(prompt_id))
            }
            _ = expiry => {
                self.lock().remove(&prompt_id);
                tracing::warn!(prompt_id = %prompt_id, "Human prompt timed out");
                self.events.publish(EngineEvent::HumanTimeout {
                    prompt_id: prompt_id.clone(),
                    task_id,
                });
                Err(HumanInputError::Timeout(prompt_id))
            }
            _ = cancelled => {
                self.lock().remove(&prompt_id);
                tracing::info!(prompt_id = %prompt_id, "Human prompt abandoned on cancellation");
                Err(HumanInputError::Cancelled(prompt_id))
            }
        };
        slot.disarm();
        outcome
    }

    /// Resolve a pending prompt.
    ///
    /// Returns `false` if the prompt is unknown, already answered or expired;
    /// the call is then a no-op.
    pub async fn respond(&self, response: HumanResponse) -> bool {
        let Some(entry) = self.lock().remove(&response.prompt_id) else {
            tracing::debug!(prompt_id = %response.prompt_id, "Ignoring response to unknown prompt");
            return false;
        };

        tracing::info!(
            prompt_id = %response.prompt_id,
            choice = response.choice.as_deref().unwrap_or("-"),
            "Human response received"
        );
        self.events.publish(EngineEvent::HumanResponse {
            response: response.clone(),
        });
        entry.tx.send(response).is_ok()
    }

    pub async fn is_pending(&self, prompt_id: &str) -> bool {
        self.lock().contains_key(prompt_id)
    }

    /// Prompts still waiting for an answer.
    pub async fn pending_prompts(&self) -> Vec<HumanPrompt> {
        self.lock().values().map(|p| p.prompt.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn broker() -> (Arc<HumanPromptBroker>, EventBus) {
        let bus = EventBus::new(16);
        (Arc::new(HumanPromptBroker::new(bus.clone())), bus)
    }

    #[test]
    fn test_decision_parse() {
        assert_eq!(ConfirmationDecision::parse(" Accept "), Some(ConfirmationDecision::Accept));
        assert_eq!(ConfirmationDecision::parse("retry"), Some(ConfirmationDecision::Retry));
        assert_eq!(ConfirmationDecision::parse("maybe"), None);
        let response = HumanResponse::new("p1").with_choice("reject");
        assert_eq!(response.decision(), Some(ConfirmationDecision::Reject));
    }

    #[tokio::test]
    async fn test_response_resolves_exactly_once() {
        let (broker, _bus) = broker();
        let prompt = HumanPrompt::new(PromptType::Confirmation, "Check", "Looks right?")
            .with_id("p1")
            .with_options(ConfirmationDecision::OPTIONS);

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request(prompt, None).await })
        };
        while !broker.is_pending("p1").await {
            tokio::task::yield_now().await;
        }

        assert!(broker.respond(HumanResponse::new("p1").with_choice("accept")).await);
        assert!(!broker.respond(HumanResponse::new("p1").with_choice("reject")).await);

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.decision(), Some(ConfirmationDecision::Accept));
        assert!(broker.pending_prompts().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_prompt_and_emits_event() {
        let (broker, bus) = broker();
        let mut events = bus.subscribe();
        let prompt = HumanPrompt::new(PromptType::Input, "Name", "Pick a name")
            .with_id("p2")
            .with_timeout(Duration::from_secs(5));

        let err = broker.request(prompt, None).await.unwrap_err();
        assert_eq!(err, HumanInputError::Timeout("p2".to_string()));
        assert!(!broker.is_pending("p2").await);
        assert!(!broker.respond(HumanResponse::new("p2").with_choice("late")).await);

        assert!(matches!(events.recv().await.unwrap(), EngineEvent::HumanPrompt { .. }));
        assert!(matches!(events.recv().await.unwrap(), EngineEvent::HumanTimeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_prompt() {
        let (broker, _bus) = broker();
        let token = CancellationToken::new();
        token.cancel();

        let prompt = HumanPrompt::new(PromptType::Approval, "Ship", "Ship it?").with_id("p3");
        let err = broker.request(prompt, Some(&token)).await.unwrap_err();
        assert_eq!(err, HumanInputError::Cancelled("p3".to_string()));
        assert!(!broker.is_pending("p3").await);
    }

    #[tokio::test]
    async fn test_dropped_waiter_withdraws_prompt() {
        let (broker, _bus) = broker();
        let prompt = HumanPrompt::new(PromptType::Confirmation, "Check", "Still there?")
            .with_id("p4");
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request(prompt, None).await })
        };
        while !broker.is_pending("p4").await {
            tokio::task::yield_now().await;
        }

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert!(!broker.is_pending("p4").await);
        assert!(broker.pending_prompts().await.is_empty());
        assert!(!broker.respond(HumanResponse::new("p4").with_choice("accept")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_beats_expiry_in_same_poll() {
        let (broker, _bus) = broker();
        let prompt = HumanPrompt::new(PromptType::Confirmation, "Check", "Quick")
            .with_id("p5")
            .with_timeout(Duration::from_secs(1));
        let mut waiter = tokio_test::task::spawn(broker.request(prompt, None));
        tokio_test::assert_pending!(waiter.poll());

        assert!(broker.respond(HumanResponse::new("p5").with_choice("accept")).await);
        tokio::time::advance(Duration::from_secs(2)).await;

        let response = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(response.decision(), Some(ConfirmationDecision::Accept));
    }

    #[tokio::test]
    async fn test_duplicate_prompt_rejected() {
        let (broker, _bus) = broker();
        let first = HumanPrompt::new(PromptType::Input, "A", "a").with_id("dup");
        let waiter = {
            let broker = Arc::clone(&broker);
            let first = first.clone();
            tokio::spawn(async move { broker.request(first, None).await })
        };
        while !broker.is_pending("dup").await {
            tokio::task::yield_now().await;
        }

        let err = broker.request(first, None).await.unwrap_err();
        assert_eq!(err, HumanInputError::DuplicatePrompt("dup".to_string()));

        broker.respond(HumanResponse::new("dup").with_input("ok")).await;
        assert_eq!(waiter.await.unwrap().unwrap().input.as_deref(), Some("ok"));
    }
}
