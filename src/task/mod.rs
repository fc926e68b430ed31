//! Task module - definitions, step callables, run state and results.
//!
//! Definitions are plain data plus trait objects; everything the engine
//! mutates lives in `state`.

mod metadata;
pub mod state;
mod step;
#[allow(clippy::module_inception)]
pub mod task;
mod verification;

pub use metadata::{Metadata, MetadataValue};
pub use state::{StepStatus, TaskExecutionState, TaskProgress, TaskResult, TaskStatus};
pub use step::{StepContext, StepExecute, StepResult, StepRollback, StepVerify};
pub use task::{
    CheckpointFrequency, RetryStrategy, StepConfig, StepDefinition, TaskConfig,
    TaskConfigOverrides, TaskDefinition,
};
pub use verification::VerificationResult;
