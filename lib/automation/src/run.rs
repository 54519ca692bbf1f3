//! Run state and event folding.
//!
//! The transform events a runner publishes are the source of truth for a
//! run's intermediate state. Folding applies one event at a time to the
//! stored state; replaying a run's full event stream reconstructs it.
//!
//! The fold assumes the runner produces a sensible sequence: step-level
//! events only arrive after their step started, and statuses move
//! `waiting -> running -> terminal`.

use crate::error::FoldError;
use chrono::{DateTime, Utc};
use quarry_core::{RunId, RunStatus, WorkflowId};
use quarry_event::{Event, EventPayload, TransformStepLifecycle};
use serde::{Deserialize, Serialize};

/// The recorded state of a single step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Step name from the transform script.
    pub name: String,
    /// Step category (download, transform, save, ...).
    pub category: String,
    /// Current status of the step.
    pub status: RunStatus,
    /// When the step began.
    pub start_time: Option<DateTime<Utc>>,
    /// When the step finished.
    pub stop_time: Option<DateTime<Utc>>,
    /// Wall-clock duration in nanoseconds, once both times are known.
    pub duration_ns: Option<i64>,
    /// Output events (prints, errors, previews) the step produced.
    #[serde(default)]
    pub output: Vec<Event>,
}

impl StepState {
    fn started(step: &TransformStepLifecycle, at: DateTime<Utc>) -> Self {
        Self {
            name: step.name.clone(),
            category: step.category.clone(),
            status: RunStatus::Running,
            start_time: Some(at),
            stop_time: None,
            duration_ns: None,
            output: Vec::new(),
        }
    }

    fn skipped(step: &TransformStepLifecycle) -> Self {
        Self {
            name: step.name.clone(),
            category: step.category.clone(),
            status: RunStatus::Skipped,
            start_time: None,
            stop_time: None,
            duration_ns: None,
            output: Vec::new(),
        }
    }

    fn recompute_duration(&mut self) {
        self.duration_ns = match (self.start_time, self.stop_time) {
            (Some(start), Some(stop)) => (stop - start).num_nanoseconds(),
            _ => None,
        };
    }
}

/// The recorded state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Unique identifier; equals the session ID on the run's events.
    pub id: RunId,
    /// The workflow this run executed.
    pub workflow_id: WorkflowId,
    /// Ordinal of this run within the workflow's history, assigned by the
    /// run store on creation.
    #[serde(default)]
    pub number: u64,
    /// Current status.
    pub status: RunStatus,
    /// Failure message, when the runner reported an error.
    pub message: Option<String>,
    /// When the transform began.
    pub start_time: Option<DateTime<Utc>>,
    /// When the transform finished.
    pub stop_time: Option<DateTime<Utc>>,
    /// Wall-clock duration in nanoseconds, once both times are known.
    pub duration_ns: Option<i64>,
    /// Per-step state, in the order steps started.
    #[serde(default)]
    pub steps: Vec<StepState>,
}

impl RunState {
    /// Creates a waiting run for the given workflow.
    #[must_use]
    pub fn new(id: RunId, workflow_id: WorkflowId) -> Self {
        Self {
            id,
            workflow_id,
            number: 0,
            status: RunStatus::Waiting,
            message: None,
            start_time: None,
            stop_time: None,
            duration_ns: None,
            steps: Vec::new(),
        }
    }

    /// Returns true once the run has reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Recomputes the run duration from its start and stop times.
    pub fn recompute_duration(&mut self) {
        self.duration_ns = match (self.start_time, self.stop_time) {
            (Some(start), Some(stop)) => (stop - start).num_nanoseconds(),
            _ => None,
        };
    }

    /// Folds one transform event into this state.
    ///
    /// Events whose session does not match this run are not this run's
    /// concern and are ignored without error. Steps are append-only:
    /// nothing reorders or removes an existing step.
    ///
    /// # Errors
    ///
    /// Returns an error for event types outside the transform set, and
    /// for step-level events with no step in progress.
    pub fn add_transform_event(&mut self, event: &Event) -> Result<(), FoldError> {
        if event.session_id.as_ref() != Some(&self.id) {
            return Ok(());
        }

        match &event.payload {
            EventPayload::TransformStart(_) => {
                self.status = RunStatus::Running;
                self.start_time = Some(event.timestamp);
            }
            EventPayload::TransformStop(lifecycle) => {
                self.stop_time = Some(event.timestamp);
                if let Some(status) = lifecycle.status {
                    self.status = status;
                }
                self.recompute_duration();
            }
            EventPayload::TransformStepStart(step) => {
                self.steps.push(StepState::started(step, event.timestamp));
            }
            EventPayload::TransformStepStop(step) => {
                let last = self.steps.last_mut().ok_or(FoldError::MissingStep {
                    event_type: event.event_type(),
                })?;
                last.stop_time = Some(event.timestamp);
                last.status = step.status.unwrap_or(RunStatus::Failed);
                last.recompute_duration();
            }
            EventPayload::TransformStepSkip(step) => {
                self.steps.push(StepState::skipped(step));
            }
            EventPayload::TransformPrint(_)
            | EventPayload::TransformError(_)
            | EventPayload::TransformDatasetPreview(_) => {
                let last = self.steps.last_mut().ok_or(FoldError::MissingStep {
                    event_type: event.event_type(),
                })?;
                last.output.push(event.clone());
            }
            EventPayload::TransformCanceled(_) => {}
            other => {
                return Err(FoldError::UnexpectedEventType {
                    event_type: other.event_type(),
                });
            }
        }

        Ok(())
    }
}
