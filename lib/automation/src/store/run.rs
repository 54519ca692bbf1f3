//! Run store implementations.

use crate::error::RunStoreError;
use crate::run::RunState;
use crate::store::{ListParams, RunStore};
use async_trait::async_trait;
use quarry_core::{OwnerId, RunId, RunStatus, WorkflowId};
use quarry_event::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// File name of the run snapshot inside the store directory.
const RUNS_FILE: &str = "runs.json";

/// Per-workflow run bookkeeping: how many runs were recorded and their
/// IDs in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct WorkflowRuns {
    count: u64,
    #[serde(default)]
    run_ids: Vec<RunId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunSet {
    #[serde(default)]
    workflows: HashMap<WorkflowId, WorkflowRuns>,
    #[serde(default)]
    runs: HashMap<RunId, RunState>,
}

/// In-memory run store.
///
/// A single mutex guards both indexes; reads hand back clones.
pub struct MemRunStore {
    set: Mutex<RunSet>,
}

impl MemRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            set: Mutex::new(RunSet::default()),
        }
    }

    fn hydrate(set: RunSet) -> Self {
        Self {
            set: Mutex::new(set),
        }
    }

    fn locked(&self) -> MutexGuard<'_, RunSet> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> (HashMap<WorkflowId, WorkflowRuns>, HashMap<RunId, RunState>) {
        let set = self.locked();
        (set.workflows.clone(), set.runs.clone())
    }
}

impl Default for MemRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for MemRunStore {
    async fn create(&self, mut state: RunState) -> Result<RunState, RunStoreError> {
        let mut guard = self.locked();
        let set = &mut *guard;
        if set.runs.contains_key(&state.id) {
            return Err(RunStoreError::Exists { run_id: state.id });
        }

        let entry = set.workflows.entry(state.workflow_id).or_default();
        entry.count += 1;
        entry.run_ids.push(state.id);
        state.number = entry.count;

        set.runs.insert(state.id, state.clone());
        Ok(state)
    }

    async fn put(&self, state: RunState) -> Result<RunState, RunStoreError> {
        let mut set = self.locked();
        let stored = set
            .runs
            .get(&state.id)
            .ok_or(RunStoreError::NotFound { run_id: state.id })?;
        if stored.workflow_id != state.workflow_id {
            return Err(RunStoreError::WorkflowMismatch {
                run_id: state.id,
                stored: stored.workflow_id,
                given: state.workflow_id,
            });
        }

        set.runs.insert(state.id, state.clone());
        Ok(state)
    }

    async fn get(&self, run_id: RunId) -> Result<RunState, RunStoreError> {
        self.locked()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(RunStoreError::NotFound { run_id })
    }

    async fn count(&self, workflow_id: WorkflowId) -> Result<u64, RunStoreError> {
        self.locked()
            .workflows
            .get(&workflow_id)
            .map(|w| w.count)
            .ok_or(RunStoreError::UnknownWorkflow { workflow_id })
    }

    async fn list(
        &self,
        workflow_id: WorkflowId,
        params: ListParams,
    ) -> Result<Vec<RunState>, RunStoreError> {
        if !params.is_valid() {
            return Err(RunStoreError::OutOfBounds {
                limit: params.limit,
                offset: params.offset,
            });
        }

        let set = self.locked();
        let entry = set
            .workflows
            .get(&workflow_id)
            .ok_or(RunStoreError::UnknownWorkflow { workflow_id })?;

        let ordered: Vec<RunState> = entry
            .run_ids
            .iter()
            .rev()
            .filter_map(|id| set.runs.get(id).cloned())
            .collect();
        Ok(params.apply(&ordered))
    }

    async fn get_latest(&self, workflow_id: WorkflowId) -> Result<RunState, RunStoreError> {
        let set = self.locked();
        let entry = set
            .workflows
            .get(&workflow_id)
            .ok_or(RunStoreError::UnknownWorkflow { workflow_id })?;
        let run_id = entry
            .run_ids
            .last()
            .ok_or(RunStoreError::UnknownWorkflow { workflow_id })?;
        set.runs
            .get(run_id)
            .cloned()
            .ok_or(RunStoreError::NotFound { run_id: *run_id })
    }

    async fn get_status(&self, workflow_id: WorkflowId) -> Result<RunStatus, RunStoreError> {
        Ok(self.get_latest(workflow_id).await?.status)
    }

    async fn list_by_status(
        &self,
        _owner_id: &OwnerId,
        status: RunStatus,
        params: ListParams,
    ) -> Result<Vec<RunState>, RunStoreError> {
        if !params.is_valid() {
            return Err(RunStoreError::OutOfBounds {
                limit: params.limit,
                offset: params.offset,
            });
        }

        let set = self.locked();
        let mut latest: Vec<RunState> = set
            .workflows
            .values()
            .filter_map(|entry| entry.run_ids.last())
            .filter_map(|id| set.runs.get(id))
            .filter(|run| run.status == status)
            .cloned()
            .collect();

        latest.sort_by(|a, b| match (a.start_time, b.start_time) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.as_ulid().cmp(&b.id.as_ulid()),
        });

        Ok(params.apply(&latest))
    }

    async fn add_event(&self, run_id: RunId, event: &Event) -> Result<(), RunStoreError> {
        let mut set = self.locked();
        let run = set
            .runs
            .get_mut(&run_id)
            .ok_or(RunStoreError::NotFound { run_id })?;
        run.add_transform_event(event)?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RunStoreError> {
        Ok(())
    }
}

/// File-backed run store.
///
/// Composes an in-memory store and writes a `runs.json` snapshot on every
/// mutation and on shutdown, using a temp-file-and-rename write. An
/// unreadable snapshot recovers to an empty store.
pub struct FileRunStore {
    mem: MemRunStore,
    path: PathBuf,
}

impl FileRunStore {
    /// Opens (or initializes) the store in the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error only when the snapshot exists but cannot be read
    /// at the I/O level; a corrupt snapshot logs a warning and starts
    /// empty.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RunStoreError> {
        let path = dir.as_ref().join(RUNS_FILE);

        let mem = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<RunSet>(&bytes) {
                Ok(set) => MemRunStore::hydrate(set),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "unreadable runs snapshot, starting empty"
                    );
                    MemRunStore::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => MemRunStore::new(),
            Err(e) => {
                return Err(RunStoreError::Persistence {
                    message: e.to_string(),
                });
            }
        };

        Ok(Self { mem, path })
    }

    fn flush(&self) -> Result<(), RunStoreError> {
        let (workflows, runs) = self.mem.snapshot();
        let set = RunSet { workflows, runs };
        let bytes =
            serde_json::to_vec_pretty(&set).map_err(|e| RunStoreError::Persistence {
                message: e.to_string(),
            })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| RunStoreError::Persistence {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn create(&self, state: RunState) -> Result<RunState, RunStoreError> {
        let stored = self.mem.create(state).await?;
        self.flush()?;
        Ok(stored)
    }

    async fn put(&self, state: RunState) -> Result<RunState, RunStoreError> {
        let stored = self.mem.put(state).await?;
        self.flush()?;
        Ok(stored)
    }

    async fn get(&self, run_id: RunId) -> Result<RunState, RunStoreError> {
        self.mem.get(run_id).await
    }

    async fn count(&self, workflow_id: WorkflowId) -> Result<u64, RunStoreError> {
        self.mem.count(workflow_id).await
    }

    async fn list(
        &self,
        workflow_id: WorkflowId,
        params: ListParams,
    ) -> Result<Vec<RunState>, RunStoreError> {
        self.mem.list(workflow_id, params).await
    }

    async fn get_latest(&self, workflow_id: WorkflowId) -> Result<RunState, RunStoreError> {
        self.mem.get_latest(workflow_id).await
    }

    async fn get_status(&self, workflow_id: WorkflowId) -> Result<RunStatus, RunStoreError> {
        self.mem.get_status(workflow_id).await
    }

    async fn list_by_status(
        &self,
        owner_id: &OwnerId,
        status: RunStatus,
        params: ListParams,
    ) -> Result<Vec<RunState>, RunStoreError> {
        self.mem.list_by_status(owner_id, status, params).await
    }

    async fn add_event(&self, run_id: RunId, event: &Event) -> Result<(), RunStoreError> {
        self.mem.add_event(run_id, event).await?;
        self.flush()
    }

    async fn shutdown(&self) -> Result<(), RunStoreError> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use quarry_event::{EventPayload, TransformLifecycle};

    fn new_run(workflow_id: WorkflowId) -> RunState {
        RunState::new(RunId::new(), workflow_id)
    }

    #[tokio::test]
    async fn create_assigns_run_numbers_in_order() {
        let store = MemRunStore::new();
        let workflow_id = WorkflowId::new();

        let first = store.create(new_run(workflow_id)).await.expect("create");
        let second = store.create(new_run(workflow_id)).await.expect("create");

        assert_eq!(first.number, 1);
        assert_eq!(second.number, 2);
        assert_eq!(store.count(workflow_id).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_run_id() {
        let store = MemRunStore::new();
        let run = store
            .create(new_run(WorkflowId::new()))
            .await
            .expect("create");

        let err = store.create(run.clone()).await.unwrap_err();
        assert_eq!(err, RunStoreError::Exists { run_id: run.id });
    }

    #[tokio::test]
    async fn count_unknown_workflow_fails() {
        let store = MemRunStore::new();
        let workflow_id = WorkflowId::new();
        let err = store.count(workflow_id).await.unwrap_err();
        assert_eq!(err, RunStoreError::UnknownWorkflow { workflow_id });
    }

    #[tokio::test]
    async fn put_requires_existing_run() {
        let store = MemRunStore::new();
        let err = store.put(new_run(WorkflowId::new())).await.unwrap_err();
        assert!(matches!(err, RunStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn put_keeps_workflow_id_stable() {
        let store = MemRunStore::new();
        let workflow_id = WorkflowId::new();
        let mut run = store.create(new_run(workflow_id)).await.expect("create");

        run.workflow_id = WorkflowId::new();
        let err = store.put(run.clone()).await.unwrap_err();
        assert_eq!(
            err,
            RunStoreError::WorkflowMismatch {
                run_id: run.id,
                stored: workflow_id,
                given: run.workflow_id,
            }
        );
    }

    #[tokio::test]
    async fn list_is_latest_first() {
        let store = MemRunStore::new();
        let workflow_id = WorkflowId::new();

        let first = store.create(new_run(workflow_id)).await.expect("create");
        let second = store.create(new_run(workflow_id)).await.expect("create");
        let third = store.create(new_run(workflow_id)).await.expect("create");

        let listed = store
            .list(workflow_id, ListParams::all())
            .await
            .expect("list");
        let ids: Vec<RunId> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);
    }

    #[tokio::test]
    async fn list_pagination_boundaries() {
        let store = MemRunStore::new();
        let workflow_id = WorkflowId::new();
        for _ in 0..3 {
            store.create(new_run(workflow_id)).await.expect("create");
        }

        assert!(
            store
                .list(workflow_id, ListParams::new(0, 0))
                .await
                .expect("list")
                .is_empty()
        );
        assert!(
            store
                .list(workflow_id, ListParams::new(-1, 5))
                .await
                .expect("list")
                .is_empty()
        );
        let err = store
            .list(workflow_id, ListParams::new(-3, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RunStoreError::OutOfBounds { .. }));
    }

    #[tokio::test]
    async fn get_latest_matches_list_head() {
        let store = MemRunStore::new();
        let workflow_id = WorkflowId::new();
        for _ in 0..3 {
            store.create(new_run(workflow_id)).await.expect("create");
        }

        let latest = store.get_latest(workflow_id).await.expect("get_latest");
        let listed = store
            .list(workflow_id, ListParams::all())
            .await
            .expect("list");
        assert_eq!(latest.id, listed[0].id);
    }

    #[tokio::test]
    async fn get_status_reports_latest_run() {
        let store = MemRunStore::new();
        let workflow_id = WorkflowId::new();

        let mut run = store.create(new_run(workflow_id)).await.expect("create");
        run.status = RunStatus::Succeeded;
        store.put(run).await.expect("put");

        let status = store.get_status(workflow_id).await.expect("get_status");
        assert_eq!(status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn list_by_status_selects_latest_runs_only() {
        let store = MemRunStore::new();
        let owner = OwnerId::new("o1");

        // Workflow A: older run succeeded, latest failed.
        let wf_a = WorkflowId::new();
        let mut a1 = store.create(new_run(wf_a)).await.expect("create");
        a1.status = RunStatus::Succeeded;
        store.put(a1).await.expect("put");
        let mut a2 = store.create(new_run(wf_a)).await.expect("create");
        a2.status = RunStatus::Failed;
        a2.start_time = Some(Utc::now());
        store.put(a2.clone()).await.expect("put");

        // Workflow B: latest succeeded, started earlier than A's failure.
        let wf_b = WorkflowId::new();
        let mut b1 = store.create(new_run(wf_b)).await.expect("create");
        b1.status = RunStatus::Succeeded;
        b1.start_time = Some(Utc::now() - Duration::hours(1));
        store.put(b1.clone()).await.expect("put");

        let failed = store
            .list_by_status(&owner, RunStatus::Failed, ListParams::all())
            .await
            .expect("list_by_status");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a2.id);

        // A's succeeded run is not its latest, so only B's shows up.
        let succeeded = store
            .list_by_status(&owner, RunStatus::Succeeded, ListParams::all())
            .await
            .expect("list_by_status");
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].id, b1.id);
    }

    #[tokio::test]
    async fn list_by_status_sorts_unstarted_runs_last() {
        let store = MemRunStore::new();
        let owner = OwnerId::new("o1");

        let mut started = store
            .create(new_run(WorkflowId::new()))
            .await
            .expect("create");
        started.status = RunStatus::Waiting;
        started.start_time = Some(Utc::now());
        store.put(started.clone()).await.expect("put");

        let unstarted = store
            .create(new_run(WorkflowId::new()))
            .await
            .expect("create");

        let listed = store
            .list_by_status(&owner, RunStatus::Waiting, ListParams::all())
            .await
            .expect("list_by_status");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, started.id);
        assert_eq!(listed[1].id, unstarted.id);
    }

    #[tokio::test]
    async fn add_event_folds_into_stored_state() {
        let store = MemRunStore::new();
        let run = store
            .create(new_run(WorkflowId::new()))
            .await
            .expect("create");

        let event = Event::for_session(
            run.id,
            EventPayload::TransformStart(TransformLifecycle::default()),
        );
        store.add_event(run.id, &event).await.expect("add_event");

        let fetched = store.get(run.id).await.expect("get");
        assert_eq!(fetched.status, RunStatus::Running);
        assert_eq!(fetched.start_time, Some(event.timestamp));
    }

    #[tokio::test]
    async fn add_event_for_unknown_run_is_not_found() {
        let store = MemRunStore::new();
        let run_id = RunId::new();
        let event = Event::for_session(
            run_id,
            EventPayload::TransformStart(TransformLifecycle::default()),
        );

        let err = store.add_event(run_id, &event).await.unwrap_err();
        assert_eq!(err, RunStoreError::NotFound { run_id });
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workflow_id = WorkflowId::new();

        let store = FileRunStore::open(dir.path()).expect("open");
        let run = store.create(new_run(workflow_id)).await.expect("create");
        store.shutdown().await.expect("shutdown");

        let reopened = FileRunStore::open(dir.path()).expect("reopen");
        let fetched = reopened.get(run.id).await.expect("get");
        assert_eq!(fetched, run);
        assert_eq!(reopened.count(workflow_id).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn corrupt_snapshot_recovers_to_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(RUNS_FILE), b"not json at all").expect("write");

        let store = FileRunStore::open(dir.path()).expect("open");
        let err = store.get(RunId::new()).await.unwrap_err();
        assert!(matches!(err, RunStoreError::NotFound { .. }));
    }
}
