//! Trigger listeners.
//!
//! A listener is a long-lived agent that watches for one kind of trigger
//! condition and publishes a `WorkflowTrigger` event on the bus when it
//! fires. One listener instance serves every workflow with triggers of
//! its kind; the orchestrator reconciles the watched set as workflows
//! are saved, deployed, and undeployed.
//!
//! Conditions observed while a listener is stopped are swallowed: no
//! event reaches the bus.

pub mod cron;
pub mod runtime;

pub use cron::CronListener;
pub use runtime::RuntimeListener;

use crate::error::ListenerError;
use crate::trigger::{Trigger, TriggerType};
use crate::workflow::Workflow;
use async_trait::async_trait;
use quarry_core::{TriggerId, WorkflowId};
use std::collections::HashSet;

/// Contract between the orchestrator and a trigger listener.
#[async_trait]
pub trait Listener: Send + Sync {
    /// The trigger kind this listener dispatches.
    fn listens_for(&self) -> TriggerType;

    /// Adds (or refreshes) one trigger in the watched set.
    async fn connect_trigger(
        &self,
        workflow: &Workflow,
        trigger: &Trigger,
    ) -> Result<(), ListenerError>;

    /// Removes one trigger from the watched set.
    async fn disconnect_trigger(&self, workflow_id: WorkflowId, trigger_id: TriggerId);

    /// The IDs of this workflow's triggers currently in the watched set.
    async fn watched_triggers(&self, workflow_id: WorkflowId) -> Vec<TriggerId>;

    /// Begins dispatching. Fails if already started.
    async fn start(&self) -> Result<(), ListenerError>;

    /// Ceases dispatching. Watched triggers are kept for the next start.
    async fn stop(&self);

    /// Reconciles the watched set against one workflow: connects its
    /// active triggers of this listener's kind, disconnects everything
    /// else of the workflow's. An undeployed workflow contributes
    /// nothing.
    ///
    /// # Errors
    ///
    /// Fails when the workflow carries no owner ID.
    async fn update_triggers(&self, workflow: &Workflow) -> Result<(), ListenerError> {
        if workflow.owner_id.is_empty() {
            return Err(ListenerError::EmptyOwnerId {
                workflow_id: workflow.id,
            });
        }

        let desired: Vec<&Trigger> = if workflow.active {
            workflow
                .active_triggers()
                .filter(|t| t.trigger_type() == self.listens_for())
                .collect()
        } else {
            Vec::new()
        };
        let desired_ids: HashSet<TriggerId> = desired.iter().map(|t| t.id).collect();

        for stale in self.watched_triggers(workflow.id).await {
            if !desired_ids.contains(&stale) {
                self.disconnect_trigger(workflow.id, stale).await;
            }
        }
        for trigger in desired {
            self.connect_trigger(workflow, trigger).await?;
        }

        Ok(())
    }

    /// Returns true when every active trigger of this listener's kind on
    /// the workflow is in the watched set.
    async fn triggers_exist(&self, workflow: &Workflow) -> bool {
        let watched: HashSet<TriggerId> =
            self.watched_triggers(workflow.id).await.into_iter().collect();
        workflow
            .active_triggers()
            .filter(|t| t.trigger_type() == self.listens_for())
            .all(|t| watched.contains(&t.id))
    }
}
