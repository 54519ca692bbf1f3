//! Workflow records.
//!
//! A workflow binds a dataset to an owner, a set of triggers, and a set
//! of hooks. Workflows are persistent: the automation layer keeps at most
//! one per dataset.

use crate::error::WorkflowStoreError;
use crate::hook::Hook;
use crate::trigger::Trigger;
use chrono::{DateTime, Utc};
use quarry_core::{DatasetId, HookId, OwnerId, TriggerId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A persistent description of an automated dataset transform.
///
/// While `active` is false the workflow's triggers are detached from
/// listeners and nothing fires, but the record (and its run history)
/// remains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier.
    pub id: WorkflowId,
    /// The dataset this workflow automates.
    pub dataset_id: DatasetId,
    /// The profile that owns this workflow.
    pub owner_id: OwnerId,
    /// When the workflow was created.
    pub created: DateTime<Utc>,
    /// Whether the workflow is deployed (triggers attached to listeners).
    #[serde(default)]
    pub active: bool,
    /// Trigger descriptors, in declaration order.
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Hook descriptors, in declaration order.
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

impl Workflow {
    /// Creates an undeployed workflow with a fresh ID and no triggers or
    /// hooks.
    #[must_use]
    pub fn new(dataset_id: DatasetId, owner_id: OwnerId) -> Self {
        Self {
            id: WorkflowId::new(),
            dataset_id,
            owner_id,
            created: Utc::now(),
            active: false,
            triggers: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Replaces the trigger list.
    #[must_use]
    pub fn with_triggers(mut self, triggers: Vec<Trigger>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Replaces the hook list.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Vec<Hook>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Marks the workflow deployed.
    #[must_use]
    pub fn deployed(mut self) -> Self {
        self.active = true;
        self
    }

    /// Checks the structural invariants: non-empty dataset and owner IDs,
    /// unique trigger IDs, unique hook IDs.
    pub fn validate(&self) -> Result<(), WorkflowStoreError> {
        if self.dataset_id.is_empty() {
            return Err(WorkflowStoreError::MissingDatasetId);
        }
        if self.owner_id.is_empty() {
            return Err(WorkflowStoreError::MissingOwnerId);
        }

        let mut trigger_ids: HashSet<TriggerId> = HashSet::new();
        for trigger in &self.triggers {
            if !trigger_ids.insert(trigger.id) {
                return Err(WorkflowStoreError::DuplicateTriggerId {
                    trigger_id: trigger.id,
                });
            }
        }

        let mut hook_ids: HashSet<HookId> = HashSet::new();
        for hook in &self.hooks {
            if !hook_ids.insert(hook.id) {
                return Err(WorkflowStoreError::DuplicateHookId { hook_id: hook.id });
            }
        }

        Ok(())
    }

    /// Returns the trigger with the given ID, if present.
    #[must_use]
    pub fn trigger(&self, trigger_id: TriggerId) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.id == trigger_id)
    }

    /// Returns a mutable reference to the trigger with the given ID.
    #[must_use]
    pub fn trigger_mut(&mut self, trigger_id: TriggerId) -> Option<&mut Trigger> {
        self.triggers.iter_mut().find(|t| t.id == trigger_id)
    }

    /// Iterates the triggers whose own activation flag is set.
    pub fn active_triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter().filter(|t| t.active)
    }

    /// Iterates the hooks whose own activation flag is set.
    pub fn active_hooks(&self) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(|h| h.active)
    }
}
