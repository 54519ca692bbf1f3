//! Event types observed and emitted by the automation core.
//!
//! Events are the glue between the orchestrator, the run store, and the
//! trigger listeners. Transform events are published by the external
//! runner while a transform script executes; workflow events bracket the
//! lifecycle of a run; hook events announce post-run notifications.

use chrono::{DateTime, Utc};
use quarry_core::{DatasetId, HookId, OwnerId, RunId, RunStatus, TriggerId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The closed set of event types the automation core observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A transform script began executing.
    TransformStart,
    /// A transform script finished.
    TransformStop,
    /// A step within a transform began.
    TransformStepStart,
    /// A step within a transform finished.
    TransformStepStop,
    /// A step within a transform was skipped.
    TransformStepSkip,
    /// A transform printed a message.
    TransformPrint,
    /// A transform reported an error message.
    TransformError,
    /// A transform produced a preview of the resulting dataset.
    TransformDatasetPreview,
    /// A transform was canceled before completion.
    TransformCanceled,
    /// A trigger condition fired for a workflow.
    WorkflowTrigger,
    /// The orchestrator began a workflow run.
    WorkflowStarted,
    /// A workflow run reached a terminal status.
    WorkflowStopped,
    /// A post-run hook was dispatched.
    HookFired,
}

impl EventType {
    /// The transform event types folded into run state.
    pub const TRANSFORM: [EventType; 9] = [
        EventType::TransformStart,
        EventType::TransformStop,
        EventType::TransformStepStart,
        EventType::TransformStepStop,
        EventType::TransformStepSkip,
        EventType::TransformPrint,
        EventType::TransformError,
        EventType::TransformDatasetPreview,
        EventType::TransformCanceled,
    ];

    /// Returns true if this type belongs to the transform fold set.
    #[must_use]
    pub fn is_transform(&self) -> bool {
        Self::TRANSFORM.contains(self)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransformStart => "transform_start",
            Self::TransformStop => "transform_stop",
            Self::TransformStepStart => "transform_step_start",
            Self::TransformStepStop => "transform_step_stop",
            Self::TransformStepSkip => "transform_step_skip",
            Self::TransformPrint => "transform_print",
            Self::TransformError => "transform_error",
            Self::TransformDatasetPreview => "transform_dataset_preview",
            Self::TransformCanceled => "transform_canceled",
            Self::WorkflowTrigger => "workflow_trigger",
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowStopped => "workflow_stopped",
            Self::HookFired => "hook_fired",
        };
        f.write_str(name)
    }
}

/// Payload of `TransformStart`, `TransformStop`, and `TransformCanceled`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformLifecycle {
    /// Number of steps the transform script declares.
    #[serde(default)]
    pub step_count: u32,
    /// Terminal status reported by the runner, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

/// Payload of the step-level lifecycle events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformStepLifecycle {
    /// Step name, unique within the transform script.
    pub name: String,
    /// Step category (download, transform, save, ...).
    #[serde(default)]
    pub category: String,
    /// Terminal status of the step, when the runner reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

/// Payload of `TransformPrint` and `TransformError`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformMessage {
    /// The printed or error message.
    pub msg: String,
}

/// Payload of `WorkflowTrigger`: a trigger condition fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTriggerEvent {
    /// Owner of the triggered workflow.
    pub owner_id: OwnerId,
    /// The workflow to run.
    pub workflow_id: WorkflowId,
    /// The trigger whose condition fired.
    pub trigger_id: TriggerId,
}

/// Payload of `WorkflowStarted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStartedEvent {
    /// Dataset the workflow automates.
    pub dataset_id: DatasetId,
    /// Owner of the workflow.
    pub owner_id: OwnerId,
    /// The workflow being run.
    pub workflow_id: WorkflowId,
    /// The run that began.
    pub run_id: RunId,
}

/// Payload of `WorkflowStopped`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStoppedEvent {
    /// Dataset the workflow automates.
    pub dataset_id: DatasetId,
    /// Owner of the workflow.
    pub owner_id: OwnerId,
    /// The workflow that ran.
    pub workflow_id: WorkflowId,
    /// The run that terminated.
    pub run_id: RunId,
    /// Terminal status of the run.
    pub status: RunStatus,
}

/// Payload of `HookFired`: a post-run notification was dispatched.
///
/// The core publishes one of these per active hook when a run terminates;
/// delivery to the outside world (HTTP, mail, ...) is the job of whatever
/// subscribes to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    /// The hook that fired.
    pub hook_id: HookId,
    /// The hook's registered type tag.
    pub hook_type: String,
    /// Dataset the workflow automates.
    pub dataset_id: DatasetId,
    /// The workflow whose run terminated.
    pub workflow_id: WorkflowId,
    /// The run that terminated.
    pub run_id: RunId,
    /// Terminal status of the run.
    pub status: RunStatus,
    /// Hook-specific destination, e.g. a webhook URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// A typed event payload. The variant determines the event's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// See [`EventType::TransformStart`].
    TransformStart(TransformLifecycle),
    /// See [`EventType::TransformStop`].
    TransformStop(TransformLifecycle),
    /// See [`EventType::TransformStepStart`].
    TransformStepStart(TransformStepLifecycle),
    /// See [`EventType::TransformStepStop`].
    TransformStepStop(TransformStepLifecycle),
    /// See [`EventType::TransformStepSkip`].
    TransformStepSkip(TransformStepLifecycle),
    /// See [`EventType::TransformPrint`].
    TransformPrint(TransformMessage),
    /// See [`EventType::TransformError`].
    TransformError(TransformMessage),
    /// See [`EventType::TransformDatasetPreview`].
    TransformDatasetPreview(JsonValue),
    /// See [`EventType::TransformCanceled`].
    TransformCanceled(TransformLifecycle),
    /// See [`EventType::WorkflowTrigger`].
    WorkflowTrigger(WorkflowTriggerEvent),
    /// See [`EventType::WorkflowStarted`].
    WorkflowStarted(WorkflowStartedEvent),
    /// See [`EventType::WorkflowStopped`].
    WorkflowStopped(WorkflowStoppedEvent),
    /// See [`EventType::HookFired`].
    HookFired(HookEvent),
}

impl EventPayload {
    /// Returns the event type for this payload.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TransformStart(_) => EventType::TransformStart,
            Self::TransformStop(_) => EventType::TransformStop,
            Self::TransformStepStart(_) => EventType::TransformStepStart,
            Self::TransformStepStop(_) => EventType::TransformStepStop,
            Self::TransformStepSkip(_) => EventType::TransformStepSkip,
            Self::TransformPrint(_) => EventType::TransformPrint,
            Self::TransformError(_) => EventType::TransformError,
            Self::TransformDatasetPreview(_) => EventType::TransformDatasetPreview,
            Self::TransformCanceled(_) => EventType::TransformCanceled,
            Self::WorkflowTrigger(_) => EventType::WorkflowTrigger,
            Self::WorkflowStarted(_) => EventType::WorkflowStarted,
            Self::WorkflowStopped(_) => EventType::WorkflowStopped,
            Self::HookFired(_) => EventType::HookFired,
        }
    }
}

/// An event as delivered to subscribers and persisted in run step output.
///
/// The session identifier ties transform events to the run that produced
/// them; events published outside any run carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// The run this event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<RunId>,
    /// The typed payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Creates an event stamped with the current time and no session.
    #[must_use]
    pub fn now(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: None,
            payload,
        }
    }

    /// Creates an event stamped with the current time for the given run.
    #[must_use]
    pub fn for_session(session_id: RunId, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: Some(session_id),
            payload,
        }
    }

    /// Returns the event type.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}
