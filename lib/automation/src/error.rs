//! Error types for the automation crate.
//!
//! Each layer owns a small error enum:
//! - `WorkflowStoreError` / `RunStoreError`: store validation and lookup
//! - `FoldError`: event-to-state folding
//! - `DecodeError`: polymorphic trigger/hook deserialization
//! - `IntervalError`: ISO-8601 repeating-interval parsing
//! - `ListenerError`: trigger listener lifecycle and reconciliation
//! - `OrchestratorError`: high-level operations (wraps the lower errors)

use crate::trigger::TriggerType;
use quarry_core::{DatasetId, HookId, RunId, TriggerId, WorkflowId};
use quarry_event::EventType;
use std::fmt;

/// Errors from workflow store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStoreError {
    /// No workflow with the given ID.
    NotFound { workflow_id: WorkflowId },
    /// No workflow automates the given dataset.
    DatasetNotFound { dataset_id: DatasetId },
    /// A workflow with the given ID is already stored.
    Exists { workflow_id: WorkflowId },
    /// Another workflow already automates the given dataset.
    DatasetExists { dataset_id: DatasetId },
    /// Workflow has an empty dataset ID.
    MissingDatasetId,
    /// Workflow has an empty owner ID.
    MissingOwnerId,
    /// Two triggers on the workflow share an ID.
    DuplicateTriggerId { trigger_id: TriggerId },
    /// Two hooks on the workflow share an ID.
    DuplicateHookId { hook_id: HookId },
    /// List parameters are out of bounds.
    OutOfBounds { limit: i64, offset: i64 },
    /// Reading or writing the backing file failed.
    Persistence { message: String },
}

impl fmt::Display for WorkflowStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::DatasetNotFound { dataset_id } => {
                write!(f, "no workflow for dataset: {dataset_id}")
            }
            Self::Exists { workflow_id } => {
                write!(f, "workflow already exists: {workflow_id}")
            }
            Self::DatasetExists { dataset_id } => {
                write!(f, "a workflow already automates dataset {dataset_id}")
            }
            Self::MissingDatasetId => write!(f, "workflow has no dataset id"),
            Self::MissingOwnerId => write!(f, "workflow has no owner id"),
            Self::DuplicateTriggerId { trigger_id } => {
                write!(f, "duplicate trigger id: {trigger_id}")
            }
            Self::DuplicateHookId { hook_id } => {
                write!(f, "duplicate hook id: {hook_id}")
            }
            Self::OutOfBounds { limit, offset } => {
                write!(f, "list parameters out of bounds: limit {limit}, offset {offset}")
            }
            Self::Persistence { message } => {
                write!(f, "workflow store persistence failed: {message}")
            }
        }
    }
}

impl std::error::Error for WorkflowStoreError {}

/// Errors from run store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStoreError {
    /// No run with the given ID.
    NotFound { run_id: RunId },
    /// A run with the given ID is already stored.
    Exists { run_id: RunId },
    /// The workflow has no recorded runs.
    UnknownWorkflow { workflow_id: WorkflowId },
    /// An update tried to move a run to a different workflow.
    WorkflowMismatch {
        run_id: RunId,
        stored: WorkflowId,
        given: WorkflowId,
    },
    /// List parameters are out of bounds.
    OutOfBounds { limit: i64, offset: i64 },
    /// Reading or writing the backing file failed.
    Persistence { message: String },
    /// Folding an event into run state failed.
    Fold(FoldError),
}

impl fmt::Display for RunStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::Exists { run_id } => write!(f, "run already exists: {run_id}"),
            Self::UnknownWorkflow { workflow_id } => {
                write!(f, "no runs recorded for workflow: {workflow_id}")
            }
            Self::WorkflowMismatch {
                run_id,
                stored,
                given,
            } => {
                write!(
                    f,
                    "run {run_id} belongs to workflow {stored}, not {given}"
                )
            }
            Self::OutOfBounds { limit, offset } => {
                write!(f, "list parameters out of bounds: limit {limit}, offset {offset}")
            }
            Self::Persistence { message } => {
                write!(f, "run store persistence failed: {message}")
            }
            Self::Fold(e) => write!(f, "event fold failed: {e}"),
        }
    }
}

impl std::error::Error for RunStoreError {}

impl From<FoldError> for RunStoreError {
    fn from(e: FoldError) -> Self {
        Self::Fold(e)
    }
}

/// Errors from folding a transform event into run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldError {
    /// The event type is not part of the transform fold set.
    UnexpectedEventType { event_type: EventType },
    /// A step-level event arrived before any step was started.
    MissingStep { event_type: EventType },
}

impl fmt::Display for FoldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEventType { event_type } => {
                write!(f, "unexpected event type: {event_type}")
            }
            Self::MissingStep { event_type } => {
                write!(f, "{event_type} event arrived with no step in progress")
            }
        }
    }
}

impl std::error::Error for FoldError {}

/// Errors from decoding polymorphic trigger/hook descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The descriptor carries no `type` tag.
    MissingTag,
    /// The `type` tag names no registered variant.
    UnexpectedType { tag: String },
    /// The tag is registered but the descriptor body does not parse.
    Malformed { reason: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTag => write!(f, "descriptor has no type tag"),
            Self::UnexpectedType { tag } => write!(f, "unexpected descriptor type: {tag}"),
            Self::Malformed { reason } => write!(f, "malformed descriptor: {reason}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors from parsing ISO-8601 repeating intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalError {
    /// The expression does not parse.
    Invalid { expression: String, reason: String },
}

impl fmt::Display for IntervalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { expression, reason } => {
                write!(f, "invalid repeating interval '{expression}': {reason}")
            }
        }
    }
}

impl std::error::Error for IntervalError {}

/// Errors from trigger listener operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The workflow being reconciled carries no owner ID.
    EmptyOwnerId { workflow_id: WorkflowId },
    /// A trigger of the wrong type was handed to the listener.
    TriggerTypeMismatch {
        expected: TriggerType,
        got: TriggerType,
    },
    /// `start` was called on a listener that is already dispatching.
    AlreadyStarted,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyOwnerId { workflow_id } => {
                write!(f, "workflow {workflow_id} has no owner id")
            }
            Self::TriggerTypeMismatch { expected, got } => {
                write!(f, "listener for {expected} triggers handed a {got} trigger")
            }
            Self::AlreadyStarted => write!(f, "listener already started"),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Errors from orchestrator operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Workflow store operation failed.
    WorkflowStore(WorkflowStoreError),
    /// Run store operation failed.
    RunStore(RunStoreError),
    /// Listener lifecycle or reconciliation failed.
    Listener(ListenerError),
    /// A dry-run transform failed.
    Apply { message: String },
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowStore(e) => write!(f, "workflow store error: {e}"),
            Self::RunStore(e) => write!(f, "run store error: {e}"),
            Self::Listener(e) => write!(f, "listener error: {e}"),
            Self::Apply { message } => write!(f, "apply failed: {message}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<WorkflowStoreError> for OrchestratorError {
    fn from(e: WorkflowStoreError) -> Self {
        Self::WorkflowStore(e)
    }
}

impl From<RunStoreError> for OrchestratorError {
    fn from(e: RunStoreError) -> Self {
        Self::RunStore(e)
    }
}

impl From<ListenerError> for OrchestratorError {
    fn from(e: ListenerError) -> Self {
        Self::Listener(e)
    }
}
