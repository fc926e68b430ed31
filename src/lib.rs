//! # Reliant
//!
//! Reliability core for multi-agent task execution.
//!
//! This library provides:
//! - A per-task state machine that runs steps with retries, verification and timeouts
//! - Confidence-gated human review with accept/retry/reject decisions
//! - Budget tracking against a per-task cost limit
//! - Checkpoints (memory, JSON file or SQLite) and resumption
//! - A typed event stream for dashboards and transports
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │     ReliabilityOrchestrator      │
//!        │  (registry, prompts, events)     │
//!        └───────┬──────────────────┬───────┘
//!                │                  │
//!                ▼                  ▼
//!       ┌─────────────────┐  ┌──────────────────┐
//!       │  TaskExecution  │  │ HumanPromptBroker│
//!       │  (step protocol)│  │ (oneshot + timer)│
//!       └───┬─────────┬───┘  └──────────────────┘
//!           │         │
//!           ▼         ▼
//!   ┌─────────────┐ ┌─────────────────┐
//!   │ BudgetHandle│ │ CheckpointStore │
//!   └─────────────┘ └─────────────────┘
//! ```
//!
//! ## Task Flow
//! 1. Caller hands a `TaskDefinition` to `execute_task`
//! 2. Each step runs under its timeout, then optional verification
//! 3. Low-confidence results wait for a human decision
//! 4. Cost is charged, a checkpoint is written, progress is published
//! 5. The run resolves into a `TaskResult`
//!
//! ## Modules
//! - `task`: definitions, step callables, results and run state
//! - `execution`: the `TaskExecution` state machine
//! - `orchestrator`: public API over running tasks
//! - `checkpoint`: checkpoint data and storage backends

pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod human;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod retry;
pub mod task;

pub use config::EngineConfig;
pub use error::{CheckpointError, EngineError, ExecutionError, HumanInputError};
pub use events::{EngineEvent, EventBus};
pub use execution::TaskExecution;
pub use human::{ConfirmationDecision, HumanPrompt, HumanResponse, PromptPriority, PromptType};
pub use orchestrator::ReliabilityOrchestrator;
pub use task::{
    StepContext, StepDefinition, StepResult, TaskConfig, TaskConfigOverrides, TaskDefinition,
    TaskProgress, TaskResult, TaskStatus, VerificationResult,
};
