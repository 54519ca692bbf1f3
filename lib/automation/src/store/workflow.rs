//! Workflow store implementations.

use crate::error::WorkflowStoreError;
use crate::store::{ListParams, WorkflowStore};
use crate::workflow::Workflow;
use async_trait::async_trait;
use quarry_core::{DatasetId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// File name of the workflow snapshot inside the store directory.
const WORKFLOWS_FILE: &str = "workflows.json";

/// In-memory workflow store.
///
/// A single mutex guards the set; every read hands back a clone so
/// callers can mutate freely without touching the stored record.
pub struct MemWorkflowStore {
    workflows: Mutex<HashMap<WorkflowId, Workflow>>,
}

impl MemWorkflowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            workflows: Mutex::new(HashMap::new()),
        }
    }

    fn hydrate(workflows: Vec<Workflow>) -> Self {
        let map = workflows.into_iter().map(|w| (w.id, w)).collect();
        Self {
            workflows: Mutex::new(map),
        }
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<WorkflowId, Workflow>> {
        self.workflows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns every stored workflow, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Workflow> {
        let mut items: Vec<Workflow> = self.locked().values().cloned().collect();
        items.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.as_ulid().cmp(&b.id.as_ulid())));
        items
    }

    fn listed(
        &self,
        params: ListParams,
        deployed_only: bool,
    ) -> Result<Vec<Workflow>, WorkflowStoreError> {
        if !params.is_valid() {
            return Err(WorkflowStoreError::OutOfBounds {
                limit: params.limit,
                offset: params.offset,
            });
        }

        let mut items = self.snapshot();
        items.reverse();
        if deployed_only {
            items.retain(|w| w.active);
        }
        Ok(params.apply(&items))
    }
}

impl Default for MemWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemWorkflowStore {
    async fn create(&self, workflow: Workflow) -> Result<Workflow, WorkflowStoreError> {
        workflow.validate()?;

        let mut workflows = self.locked();
        if workflows.contains_key(&workflow.id) {
            return Err(WorkflowStoreError::Exists {
                workflow_id: workflow.id,
            });
        }
        if workflows.values().any(|w| w.dataset_id == workflow.dataset_id) {
            return Err(WorkflowStoreError::DatasetExists {
                dataset_id: workflow.dataset_id.clone(),
            });
        }

        workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn update(&self, workflow: Workflow) -> Result<Workflow, WorkflowStoreError> {
        workflow.validate()?;

        let mut workflows = self.locked();
        if !workflows.contains_key(&workflow.id) {
            return Err(WorkflowStoreError::NotFound {
                workflow_id: workflow.id,
            });
        }
        let collision = workflows
            .values()
            .any(|w| w.id != workflow.id && w.dataset_id == workflow.dataset_id);
        if collision {
            return Err(WorkflowStoreError::DatasetExists {
                dataset_id: workflow.dataset_id.clone(),
            });
        }

        workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get(&self, workflow_id: WorkflowId) -> Result<Workflow, WorkflowStoreError> {
        self.locked()
            .get(&workflow_id)
            .cloned()
            .ok_or(WorkflowStoreError::NotFound { workflow_id })
    }

    async fn get_by_dataset(
        &self,
        dataset_id: &DatasetId,
    ) -> Result<Workflow, WorkflowStoreError> {
        if dataset_id.is_empty() {
            return Err(WorkflowStoreError::DatasetNotFound {
                dataset_id: dataset_id.clone(),
            });
        }
        self.locked()
            .values()
            .find(|w| &w.dataset_id == dataset_id)
            .cloned()
            .ok_or_else(|| WorkflowStoreError::DatasetNotFound {
                dataset_id: dataset_id.clone(),
            })
    }

    async fn remove(&self, workflow_id: WorkflowId) -> Result<(), WorkflowStoreError> {
        self.locked()
            .remove(&workflow_id)
            .map(|_| ())
            .ok_or(WorkflowStoreError::NotFound { workflow_id })
    }

    async fn list(&self, params: ListParams) -> Result<Vec<Workflow>, WorkflowStoreError> {
        self.listed(params, false)
    }

    async fn list_deployed(
        &self,
        params: ListParams,
    ) -> Result<Vec<Workflow>, WorkflowStoreError> {
        self.listed(params, true)
    }

    async fn shutdown(&self) -> Result<(), WorkflowStoreError> {
        Ok(())
    }
}

/// Serialized shape of the workflow snapshot file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkflowsFile {
    #[serde(default)]
    workflows: Vec<Workflow>,
}

/// File-backed workflow store.
///
/// Composes an in-memory store and writes a `workflows.json` snapshot on
/// every mutation and on shutdown. Snapshots are written to a temp file
/// and renamed into place. An unreadable or partially-written snapshot
/// recovers to an empty store.
pub struct FileWorkflowStore {
    mem: MemWorkflowStore,
    path: PathBuf,
}

impl FileWorkflowStore {
    /// Opens (or initializes) the store in the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error only when the snapshot exists but cannot be read
    /// at the I/O level; a corrupt snapshot logs a warning and starts
    /// empty.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, WorkflowStoreError> {
        let path = dir.as_ref().join(WORKFLOWS_FILE);

        let mem = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<WorkflowsFile>(&bytes) {
                Ok(file) => MemWorkflowStore::hydrate(file.workflows),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "unreadable workflows snapshot, starting empty"
                    );
                    MemWorkflowStore::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => MemWorkflowStore::new(),
            Err(e) => {
                return Err(WorkflowStoreError::Persistence {
                    message: e.to_string(),
                });
            }
        };

        Ok(Self { mem, path })
    }

    fn flush(&self) -> Result<(), WorkflowStoreError> {
        let file = WorkflowsFile {
            workflows: self.mem.snapshot(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|e| {
            WorkflowStoreError::Persistence {
                message: e.to_string(),
            }
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| WorkflowStoreError::Persistence {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn create(&self, workflow: Workflow) -> Result<Workflow, WorkflowStoreError> {
        let stored = self.mem.create(workflow).await?;
        self.flush()?;
        Ok(stored)
    }

    async fn update(&self, workflow: Workflow) -> Result<Workflow, WorkflowStoreError> {
        let stored = self.mem.update(workflow).await?;
        self.flush()?;
        Ok(stored)
    }

    async fn get(&self, workflow_id: WorkflowId) -> Result<Workflow, WorkflowStoreError> {
        self.mem.get(workflow_id).await
    }

    async fn get_by_dataset(
        &self,
        dataset_id: &DatasetId,
    ) -> Result<Workflow, WorkflowStoreError> {
        self.mem.get_by_dataset(dataset_id).await
    }

    async fn remove(&self, workflow_id: WorkflowId) -> Result<(), WorkflowStoreError> {
        self.mem.remove(workflow_id).await?;
        self.flush()
    }

    async fn list(&self, params: ListParams) -> Result<Vec<Workflow>, WorkflowStoreError> {
        self.mem.list(params).await
    }

    async fn list_deployed(
        &self,
        params: ListParams,
    ) -> Result<Vec<Workflow>, WorkflowStoreError> {
        self.mem.list_deployed(params).await
    }

    async fn shutdown(&self) -> Result<(), WorkflowStoreError> {
        self.flush()
    }
}
