//! OpsGate workflow engine.
//!
//! Runs task graphs of intents through the kernel's router with
//! dependency ordering, bounded concurrency, confirmation checkpoints and
//! partial-failure semantics.
//!
//! - **[`workflow`]** -- Tasks, task states, and graph validation.
//! - **[`scheduler`]** -- The coordinating loop, retries, timeouts and
//!   cancellation.
//! - **[`confirmation`]** -- Pluggable approval backends behind a timeout.
//! - **[`prompt`]** -- Risk-tier prompt templates.
//! - **[`report`]** -- Per-task and per-workflow outcomes.
//! - **[`engine`]** -- Everything wired together from [`EngineConfig`].

pub mod config;
pub mod confirmation;
pub mod engine;
pub mod error;
pub mod logging;
pub mod prompt;
pub mod report;
pub mod scheduler;
pub mod workflow;

pub use config::{ConfirmationConfig, EngineConfig};
pub use confirmation::{
    CallbackBackend, Confirmation, ConfirmationBackend, ConfirmationChannel, ConfirmationDecision,
    ConfirmationInbox, ConfirmationOutcome, ConfirmationRequest, DenyAllBackend,
    PendingConfirmation, QueuedBackend,
};
pub use engine::{Engine, EngineBuilder};
pub use error::{Result, WorkflowError};
pub use logging::{LogFormat, LoggingConfig, init_tracing};
pub use prompt::{PromptTemplates, PromptVars};
pub use report::{TaskReason, TaskReport, WorkflowReport};
pub use scheduler::{CancellationHandle, SchedulerConfig, WorkflowScheduler};
pub use workflow::{Task, TaskGraph, TaskState, Workflow, WorkflowStatus};
