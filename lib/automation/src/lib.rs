//! Workflow orchestration for the quarry dataset automation platform.
//!
//! This crate binds triggers (conditions under which work should begin)
//! to workflows (persistent descriptions of automated dataset
//! transforms) to runs (records of one execution attempt) and hooks
//! (post-run notifications):
//!
//! - **Workflows**: persistent records keyed by workflow ID, unique per
//!   dataset
//! - **Triggers & Listeners**: runtime and cron trigger descriptors with
//!   long-lived listener agents that publish trigger events on the bus
//! - **Runs**: event-sourced run state folded from the transform events
//!   an external runner publishes
//! - **Hooks**: post-run notifications announced on the bus
//! - **Stores**: in-memory and file-backed workflow/run persistence
//! - **Orchestrator**: the central coordinator tying all of it together

pub mod error;
pub mod hook;
pub mod interval;
pub mod listener;
pub mod orchestrator;
pub mod run;
pub mod store;
pub mod trigger;
pub mod workflow;

pub use error::{
    DecodeError, FoldError, IntervalError, ListenerError, OrchestratorError, RunStoreError,
    WorkflowStoreError,
};
pub use hook::{Hook, HookConfig, HookType};
pub use interval::RepeatingInterval;
pub use listener::{CronListener, Listener, RuntimeListener};
pub use orchestrator::{
    Orchestrator, OrchestratorOptions, TransformApplier, TransformError, TransformRunner,
};
pub use run::{RunState, StepState};
pub use store::{
    FileRunStore, FileWorkflowStore, ListParams, MemRunStore, MemWorkflowStore, RunStore,
    WorkflowStore,
};
pub use trigger::{Trigger, TriggerConfig, TriggerType};
pub use workflow::Workflow;
