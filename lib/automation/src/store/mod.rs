//! Workflow and run persistence.
//!
//! Both stores are trait contracts with two implementations: an
//! in-memory variant guarding its set with a single mutex, and a
//! file-backed variant that composes the in-memory store and flushes a
//! JSON snapshot to disk on every mutation and on shutdown.

pub mod run;
pub mod workflow;

use crate::error::{RunStoreError, WorkflowStoreError};
use crate::run::RunState;
use crate::workflow::Workflow;
use async_trait::async_trait;
use quarry_core::{DatasetId, OwnerId, RunId, RunStatus, WorkflowId};
use quarry_event::Event;

pub use run::{FileRunStore, MemRunStore};
pub use workflow::{FileWorkflowStore, MemWorkflowStore};

/// Pagination parameters for list operations.
///
/// A limit of `-1` means "no limit"; any other negative limit, or a
/// negative offset, is out of bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListParams {
    /// Maximum number of items to return, or `-1` for all.
    pub limit: i64,
    /// Number of items to skip.
    pub offset: i64,
}

impl ListParams {
    /// Parameters selecting every item.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            limit: -1,
            offset: 0,
        }
    }

    /// Parameters selecting a page.
    #[must_use]
    pub const fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Returns true if the parameters are within bounds.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.limit >= -1 && self.offset >= 0
    }

    /// Applies the parameters to an ordered slice.
    ///
    /// Callers must check `is_valid` first; this treats the parameters as
    /// well-formed.
    pub(crate) fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let offset = self.offset as usize;
        if self.limit == 0 || offset >= items.len() {
            return Vec::new();
        }
        let rest = &items[offset..];
        if self.limit < 0 {
            rest.to_vec()
        } else {
            rest.iter().take(self.limit as usize).cloned().collect()
        }
    }
}

impl Default for ListParams {
    fn default() -> Self {
        Self::all()
    }
}

/// Persistent set of workflows, unique per dataset.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Stores a new workflow.
    ///
    /// Fails with `DatasetExists` when another workflow already automates
    /// the same dataset, and `Exists` when the ID is already stored.
    async fn create(&self, workflow: Workflow) -> Result<Workflow, WorkflowStoreError>;

    /// Replaces an existing workflow.
    async fn update(&self, workflow: Workflow) -> Result<Workflow, WorkflowStoreError>;

    /// Fetches a workflow by ID.
    async fn get(&self, workflow_id: WorkflowId) -> Result<Workflow, WorkflowStoreError>;

    /// Fetches the workflow automating a dataset. An empty dataset ID is
    /// always `DatasetNotFound`.
    async fn get_by_dataset(
        &self,
        dataset_id: &DatasetId,
    ) -> Result<Workflow, WorkflowStoreError>;

    /// Removes a workflow. Removing an unknown ID is `NotFound`.
    async fn remove(&self, workflow_id: WorkflowId) -> Result<(), WorkflowStoreError>;

    /// Lists workflows, most recently created first.
    async fn list(&self, params: ListParams) -> Result<Vec<Workflow>, WorkflowStoreError>;

    /// As `list`, restricted to deployed (active) workflows.
    async fn list_deployed(
        &self,
        params: ListParams,
    ) -> Result<Vec<Workflow>, WorkflowStoreError>;

    /// Flushes state. A no-op for purely in-memory implementations.
    async fn shutdown(&self) -> Result<(), WorkflowStoreError>;
}

/// Persistent set of run states, grouped by workflow.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Records a new run, assigning its ordinal within the workflow's
    /// history. Fails with `Exists` for a duplicate run ID.
    async fn create(&self, state: RunState) -> Result<RunState, RunStoreError>;

    /// Replaces an existing run's state. The workflow a run belongs to is
    /// immutable; a mismatch is `WorkflowMismatch`.
    async fn put(&self, state: RunState) -> Result<RunState, RunStoreError>;

    /// Fetches a run by ID.
    async fn get(&self, run_id: RunId) -> Result<RunState, RunStoreError>;

    /// Number of runs recorded for a workflow.
    async fn count(&self, workflow_id: WorkflowId) -> Result<u64, RunStoreError>;

    /// Lists a workflow's runs, most recent first.
    async fn list(
        &self,
        workflow_id: WorkflowId,
        params: ListParams,
    ) -> Result<Vec<RunState>, RunStoreError>;

    /// Fetches the most recently created run for a workflow.
    async fn get_latest(&self, workflow_id: WorkflowId) -> Result<RunState, RunStoreError>;

    /// Status of the most recently created run for a workflow.
    async fn get_status(&self, workflow_id: WorkflowId) -> Result<RunStatus, RunStoreError>;

    /// Across all workflows, selects each workflow's most recent run when
    /// its status matches, sorted by start time descending (runs that
    /// never started sort last). The owner ID is advisory: run records
    /// carry no owner, so implementations ignore it.
    async fn list_by_status(
        &self,
        owner_id: &OwnerId,
        status: RunStatus,
        params: ListParams,
    ) -> Result<Vec<RunState>, RunStoreError>;

    /// Folds one event into the identified run's state.
    ///
    /// Returns `NotFound` quietly for unknown runs: on the bus, events can
    /// outrace run creation.
    async fn add_event(&self, run_id: RunId, event: &Event) -> Result<(), RunStoreError>;

    /// Flushes state. A no-op for purely in-memory implementations.
    async fn shutdown(&self) -> Result<(), RunStoreError>;
}
