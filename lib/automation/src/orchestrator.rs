//! The workflow orchestrator.
//!
//! The orchestrator is the central coordinator of the automation layer:
//!
//! - Owns the bus subscriptions that fold transform events into run
//!   state and that turn `WorkflowTrigger` events into runs
//! - Hosts the externally-supplied runner and applier seams
//! - Mediates workflow store updates and keeps listeners reconciled
//! - Brackets every run with `WorkflowStarted`/`WorkflowStopped` events
//!   and fires the workflow's hooks when a run terminates
//!
//! Runs are serialized behind a single gate: transforms mutate datasets,
//! and two simultaneous runs of the same workflow must never happen.

use crate::error::{OrchestratorError, RunStoreError, WorkflowStoreError};
use crate::listener::Listener;
use crate::run::RunState;
use crate::store::{ListParams, RunStore, WorkflowStore};
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::Utc;
use quarry_core::{RunId, RunStatus, TriggerId, WorkflowId};
use quarry_event::{
    Event, EventBus, EventHandler, EventPayload, EventType, HandlerError, Subscription,
    WorkflowStartedEvent, WorkflowStoppedEvent, WorkflowTriggerEvent,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// Bound on waiting for in-flight transform events to fold after the
/// runner returns, before the final run state is read.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Error reported by a runner or applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError {
    /// What went wrong.
    pub message: String,
}

impl TransformError {
    /// Creates a transform error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transform failed: {}", self.message)
    }
}

impl std::error::Error for TransformError {}

/// Externally-supplied transform execution.
///
/// The runner performs the actual dataset transform for a run. It MUST
/// publish its transform events on the orchestrator's bus with the run's
/// ID as the session; those events are authoritative for intermediate
/// state. The returned result is an independent signal.
#[async_trait]
pub trait TransformRunner: Send + Sync {
    /// Executes the workflow's transform for the given run.
    async fn run(&self, workflow: &Workflow, run_id: RunId) -> Result<(), TransformError>;
}

/// Externally-supplied dry-run transform execution.
///
/// Appliers execute a transform without persisting anything: no run
/// state is recorded and no lifecycle events bracket the call.
#[async_trait]
pub trait TransformApplier: Send + Sync {
    /// Executes a dry-run transform.
    async fn apply(
        &self,
        wait: bool,
        run_id: RunId,
        workflow: &Workflow,
        dataset: JsonValue,
        secrets: HashMap<String, String>,
    ) -> Result<(), TransformError>;
}

/// Construction options for the orchestrator.
pub struct OrchestratorOptions {
    /// Workflow persistence.
    pub workflow_store: Arc<dyn WorkflowStore>,
    /// Run persistence.
    pub run_store: Arc<dyn RunStore>,
    /// Trigger listeners, started in registration order.
    pub listeners: Vec<Arc<dyn Listener>>,
}

/// Folds transform events from the bus into stored run state.
struct RunEventFolder {
    runs: Arc<dyn RunStore>,
}

#[async_trait]
impl EventHandler for RunEventFolder {
    async fn handle_event(&self, event: Event) -> Result<(), HandlerError> {
        let Some(run_id) = event.session_id else {
            return Ok(());
        };
        match self.runs.add_event(run_id, &event).await {
            // Events can outrace run creation across publishers; an
            // unknown run is not worth reporting.
            Ok(()) | Err(RunStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(HandlerError::new(e.to_string())),
        }
    }
}

/// Routes `WorkflowTrigger` events into run dispatch.
struct TriggerDispatcher {
    orchestrator: Weak<Orchestrator>,
}

#[async_trait]
impl EventHandler for TriggerDispatcher {
    async fn handle_event(&self, event: Event) -> Result<(), HandlerError> {
        let EventPayload::WorkflowTrigger(trigger) = event.payload else {
            return Ok(());
        };
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(());
        };
        // Dispatch on its own task so a long run does not back up the
        // trigger queue.
        tokio::spawn(async move {
            orchestrator.dispatch_trigger(trigger).await;
        });
        Ok(())
    }
}

/// The workflow orchestrator.
pub struct Orchestrator {
    bus: EventBus,
    runner: Arc<dyn TransformRunner>,
    applier: Arc<dyn TransformApplier>,
    workflows: Arc<dyn WorkflowStore>,
    runs: Arc<dyn RunStore>,
    listeners: Vec<Arc<dyn Listener>>,
    started: AtomicBool,
    run_gate: tokio::sync::Mutex<()>,
    trigger_subscription: Mutex<Option<Subscription>>,
    _fold_subscription: Subscription,
}

impl Orchestrator {
    /// Creates an orchestrator and subscribes its run-state folder to the
    /// transform events on the bus.
    ///
    /// Must be called within a tokio runtime: bus subscriptions own
    /// worker tasks.
    pub fn new(
        bus: EventBus,
        runner: Arc<dyn TransformRunner>,
        applier: Arc<dyn TransformApplier>,
        options: OrchestratorOptions,
    ) -> Arc<Self> {
        let fold_subscription = bus.subscribe_types(
            Arc::new(RunEventFolder {
                runs: Arc::clone(&options.run_store),
            }),
            &EventType::TRANSFORM,
        );

        Arc::new(Self {
            bus,
            runner,
            applier,
            workflows: options.workflow_store,
            runs: options.run_store,
            listeners: options.listeners,
            started: AtomicBool::new(false),
            run_gate: tokio::sync::Mutex::new(()),
            trigger_subscription: Mutex::new(None),
            _fold_subscription: fold_subscription,
        })
    }

    /// Returns true while the orchestrator is dispatching triggers.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Reconciles every listener against all deployed workflows, starts
    /// the listeners in registration order, and begins dispatching
    /// trigger events. Idempotent once started.
    ///
    /// # Errors
    ///
    /// Listener reconciliation or startup failures are reported to the
    /// caller.
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.is_started() {
            return Ok(());
        }

        let deployed = self.workflows.list_deployed(ListParams::all()).await?;
        for listener in &self.listeners {
            for workflow in &deployed {
                listener.update_triggers(workflow).await?;
            }
            listener.start().await?;
        }

        let subscription = self.bus.subscribe_types(
            Arc::new(TriggerDispatcher {
                orchestrator: Arc::downgrade(self),
            }),
            &[EventType::WorkflowTrigger],
        );
        *self.trigger_slot() = Some(subscription);
        self.started.store(true, Ordering::SeqCst);

        tracing::info!(workflows = deployed.len(), "orchestrator started");
        Ok(())
    }

    /// Stops every listener and ceases trigger dispatch. Returns
    /// promptly; outstanding runs complete on their own tasks.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        for listener in &self.listeners {
            listener.stop().await;
        }
        self.trigger_slot().take();
        tracing::info!("orchestrator stopped");
    }

    /// Stores a new workflow, stamping its creation time, and reconciles
    /// listeners when started.
    pub async fn deploy(&self, mut workflow: Workflow) -> Result<Workflow, OrchestratorError> {
        workflow.created = Utc::now();
        let stored = self.workflows.create(workflow).await?;
        self.reconcile_listeners(&stored).await;
        Ok(stored)
    }

    /// Replaces an existing workflow and reconciles listeners when
    /// started. Reconciliation is best-effort: a listener failure after
    /// a successful store update is logged, and listeners may lag until
    /// the next start.
    pub async fn save_workflow(&self, workflow: Workflow) -> Result<Workflow, OrchestratorError> {
        let stored = self.workflows.update(workflow).await?;
        self.reconcile_listeners(&stored).await;
        Ok(stored)
    }

    /// Fetches a workflow by ID.
    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, OrchestratorError> {
        Ok(self.workflows.get(workflow_id).await?)
    }

    /// Lists workflows, most recently created first.
    pub async fn list_workflows(
        &self,
        params: ListParams,
    ) -> Result<Vec<Workflow>, OrchestratorError> {
        Ok(self.workflows.list(params).await?)
    }

    /// As `list_workflows`, restricted to deployed workflows.
    pub async fn list_deployed_workflows(
        &self,
        params: ListParams,
    ) -> Result<Vec<Workflow>, OrchestratorError> {
        Ok(self.workflows.list_deployed(params).await?)
    }

    /// Runs a workflow now, outside any trigger.
    ///
    /// A runner failure is captured into the final run state and the
    /// `WorkflowStopped` event, not returned here; only store failures
    /// surface as errors.
    pub async fn run_workflow(
        &self,
        workflow_id: WorkflowId,
        run_id: Option<RunId>,
    ) -> Result<RunId, OrchestratorError> {
        let workflow = self.workflows.get(workflow_id).await?;
        let run_id = run_id.unwrap_or_else(RunId::new);
        self.execute(&workflow, run_id, None).await?;
        Ok(run_id)
    }

    /// Dry-runs a workflow through the applier: no run state is recorded
    /// and no lifecycle events are published.
    pub async fn apply_workflow(
        &self,
        wait: bool,
        run_id: Option<RunId>,
        workflow: &Workflow,
        dataset: JsonValue,
        secrets: HashMap<String, String>,
    ) -> Result<RunId, OrchestratorError> {
        let run_id = run_id.unwrap_or_else(RunId::new);
        self.applier
            .apply(wait, run_id, workflow, dataset, secrets)
            .await
            .map_err(|e| OrchestratorError::Apply {
                message: e.message,
            })?;
        Ok(run_id)
    }

    fn trigger_slot(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.trigger_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn reconcile_listeners(&self, workflow: &Workflow) {
        if !self.is_started() {
            return;
        }
        for listener in &self.listeners {
            if let Err(e) = listener.update_triggers(workflow).await {
                tracing::warn!(
                    error = %e,
                    workflow_id = %workflow.id,
                    "listener reconciliation failed; listeners may lag until next start"
                );
            }
        }
    }

    /// Resolves a trigger event into a run.
    async fn dispatch_trigger(&self, trigger: WorkflowTriggerEvent) {
        if !self.is_started() {
            return;
        }

        let workflow = match self.workflows.get(trigger.workflow_id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    workflow_id = %trigger.workflow_id,
                    "trigger fired for unknown workflow"
                );
                return;
            }
        };
        if !workflow.active {
            tracing::debug!(
                workflow_id = %workflow.id,
                "ignoring trigger for undeployed workflow"
            );
            return;
        }
        match workflow.trigger(trigger.trigger_id) {
            Some(t) if t.active => {}
            _ => {
                tracing::debug!(
                    workflow_id = %workflow.id,
                    trigger_id = %trigger.trigger_id,
                    "ignoring trigger not active on workflow"
                );
                return;
            }
        }

        if let Err(e) = self
            .execute(&workflow, RunId::new(), Some(trigger.trigger_id))
            .await
        {
            tracing::warn!(
                error = %e,
                workflow_id = %workflow.id,
                "triggered run failed to dispatch"
            );
        }
    }

    /// The run-dispatch protocol: create run state, bracket the runner
    /// with lifecycle events, finalize from the folded state, advance the
    /// initiating trigger, and fire hooks.
    async fn execute(
        &self,
        workflow: &Workflow,
        run_id: RunId,
        trigger_id: Option<TriggerId>,
    ) -> Result<(), OrchestratorError> {
        let _slot = self.run_gate.lock().await;

        let mut initial = RunState::new(run_id, workflow.id);
        initial.status = RunStatus::Running;
        let created = match self.runs.create(initial).await {
            Ok(state) => state,
            Err(e) => {
                // Observers must always see closure.
                self.publish_stopped(workflow, run_id, RunStatus::Failed);
                return Err(e.into());
            }
        };

        self.bus.publish_for(
            run_id,
            EventPayload::WorkflowStarted(WorkflowStartedEvent {
                dataset_id: workflow.dataset_id.clone(),
                owner_id: workflow.owner_id.clone(),
                workflow_id: workflow.id,
                run_id,
            }),
        );

        let outcome = self.runner.run(workflow, run_id).await;

        // The runner's events fold asynchronously; give them a bounded
        // chance to land before the final read.
        let _ = tokio::time::timeout(SETTLE_TIMEOUT, self.bus.settled()).await;

        let mut state = self.runs.get(run_id).await.unwrap_or(created);
        match outcome {
            Ok(()) => {
                if !state.status.is_terminal() {
                    state.status = RunStatus::Succeeded;
                }
            }
            Err(e) => {
                state.status = RunStatus::Failed;
                state.message = Some(e.message);
            }
        }
        if state.stop_time.is_none() {
            state.stop_time = Some(Utc::now());
        }
        state.recompute_duration();
        let status = state.status;

        if let Err(e) = self.runs.put(state).await {
            tracing::error!(
                error = %e,
                run_id = %run_id,
                "failed to persist final run state"
            );
        }

        if let Some(trigger_id) = trigger_id {
            self.advance_trigger(workflow.id, trigger_id).await;
        }
        self.fire_hooks(workflow.id, run_id, status).await;
        self.publish_stopped(workflow, run_id, status);

        tracing::info!(
            workflow_id = %workflow.id,
            run_id = %run_id,
            status = %status,
            "workflow run finished"
        );
        Ok(())
    }

    fn publish_stopped(&self, workflow: &Workflow, run_id: RunId, status: RunStatus) {
        self.bus.publish_for(
            run_id,
            EventPayload::WorkflowStopped(WorkflowStoppedEvent {
                dataset_id: workflow.dataset_id.clone(),
                owner_id: workflow.owner_id.clone(),
                workflow_id: workflow.id,
                run_id,
                status,
            }),
        );
    }

    /// Records that the trigger started a run.
    async fn advance_trigger(&self, workflow_id: WorkflowId, trigger_id: TriggerId) {
        let result: Result<(), WorkflowStoreError> = async {
            let mut workflow = self.workflows.get(workflow_id).await?;
            if let Some(trigger) = workflow.trigger_mut(trigger_id) {
                trigger.advance();
            }
            self.workflows.update(workflow).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                workflow_id = %workflow_id,
                trigger_id = %trigger_id,
                "failed to record trigger advance"
            );
        }
    }

    /// Publishes one `HookFired` event per active hook and records the
    /// hook advances.
    async fn fire_hooks(&self, workflow_id: WorkflowId, run_id: RunId, status: RunStatus) {
        let mut workflow = match self.workflows.get(workflow_id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                tracing::warn!(error = %e, workflow_id = %workflow_id, "cannot fire hooks");
                return;
            }
        };

        let mut fired = Vec::new();
        for hook in workflow.hooks.iter_mut().filter(|h| h.active) {
            hook.advance();
            fired.push(hook.clone());
        }
        if fired.is_empty() {
            return;
        }

        if let Err(e) = self.workflows.update(workflow.clone()).await {
            tracing::warn!(error = %e, workflow_id = %workflow_id, "failed to record hook advances");
        }
        for hook in fired {
            self.bus.publish_for(
                run_id,
                EventPayload::HookFired(hook.event(
                    workflow.dataset_id.clone(),
                    workflow.id,
                    run_id,
                    status,
                )),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::Hook;
    use crate::listener::RuntimeListener;
    use crate::store::{MemRunStore, MemWorkflowStore};
    use crate::trigger::Trigger;
    use quarry_core::{DatasetId, OwnerId};
    use quarry_event::{TransformLifecycle, TransformMessage, TransformStepLifecycle};
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(150);

    struct Collector {
        tx: UnboundedSender<Event>,
    }

    #[async_trait]
    impl EventHandler for Collector {
        async fn handle_event(&self, event: Event) -> Result<(), HandlerError> {
            self.tx.send(event).ok();
            Ok(())
        }
    }

    fn watch_bus(
        bus: &EventBus,
        types: &[EventType],
    ) -> (Subscription, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = bus.subscribe_types(Arc::new(Collector { tx }), types);
        (sub, rx)
    }

    async fn recv_event(rx: &mut UnboundedReceiver<Event>) -> Event {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("collector channel closed")
    }

    async fn assert_no_event(rx: &mut UnboundedReceiver<Event>) {
        let result = timeout(QUIET, rx.recv()).await;
        assert!(result.is_err(), "expected no event, got {result:?}");
    }

    /// Publishes the canonical one-step transform sequence for each run.
    struct ScriptedRunner {
        bus: EventBus,
    }

    #[async_trait]
    impl TransformRunner for ScriptedRunner {
        async fn run(&self, _workflow: &Workflow, run_id: RunId) -> Result<(), TransformError> {
            let step = |status| TransformStepLifecycle {
                name: "s1".to_string(),
                category: "transform".to_string(),
                status,
            };

            self.bus.publish_for(
                run_id,
                EventPayload::TransformStart(TransformLifecycle {
                    step_count: 1,
                    status: None,
                }),
            );
            self.bus
                .publish_for(run_id, EventPayload::TransformStepStart(step(None)));
            self.bus.publish_for(
                run_id,
                EventPayload::TransformPrint(TransformMessage {
                    msg: "hi".to_string(),
                }),
            );
            self.bus.publish_for(
                run_id,
                EventPayload::TransformStepStop(step(Some(RunStatus::Succeeded))),
            );
            self.bus.publish_for(
                run_id,
                EventPayload::TransformStop(TransformLifecycle {
                    step_count: 1,
                    status: Some(RunStatus::Succeeded),
                }),
            );
            Ok(())
        }
    }

    /// Publishes nothing and succeeds.
    struct QuietRunner;

    #[async_trait]
    impl TransformRunner for QuietRunner {
        async fn run(&self, _workflow: &Workflow, _run_id: RunId) -> Result<(), TransformError> {
            Ok(())
        }
    }

    /// Publishes nothing and fails.
    struct FailingRunner;

    #[async_trait]
    impl TransformRunner for FailingRunner {
        async fn run(&self, _workflow: &Workflow, _run_id: RunId) -> Result<(), TransformError> {
            Err(TransformError::new("boom"))
        }
    }

    /// Records apply invocations.
    struct RecordingApplier {
        calls: Mutex<Vec<RunId>>,
    }

    impl RecordingApplier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<RunId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransformApplier for RecordingApplier {
        async fn apply(
            &self,
            _wait: bool,
            run_id: RunId,
            _workflow: &Workflow,
            _dataset: JsonValue,
            _secrets: HashMap<String, String>,
        ) -> Result<(), TransformError> {
            self.calls.lock().unwrap().push(run_id);
            Ok(())
        }
    }

    struct Harness {
        bus: EventBus,
        orchestrator: Arc<Orchestrator>,
        workflow_store: Arc<MemWorkflowStore>,
        run_store: Arc<MemRunStore>,
        applier: Arc<RecordingApplier>,
    }

    fn harness<F>(make_runner: F) -> Harness
    where
        F: FnOnce(&EventBus) -> Arc<dyn TransformRunner>,
    {
        let bus = EventBus::new();
        let workflow_store = Arc::new(MemWorkflowStore::new());
        let run_store = Arc::new(MemRunStore::new());
        let listener = Arc::new(RuntimeListener::new(bus.clone()));
        let applier = RecordingApplier::new();
        let runner = make_runner(&bus);

        let orchestrator = Orchestrator::new(
            bus.clone(),
            runner,
            applier.clone(),
            OrchestratorOptions {
                workflow_store: workflow_store.clone(),
                run_store: run_store.clone(),
                listeners: vec![listener],
            },
        );

        Harness {
            bus,
            orchestrator,
            workflow_store,
            run_store,
            applier,
        }
    }

    fn scripted_harness() -> Harness {
        harness(|bus| Arc::new(ScriptedRunner { bus: bus.clone() }))
    }

    fn triggered_workflow() -> (Workflow, Trigger) {
        let trigger = Trigger::runtime();
        let workflow = Workflow::new(DatasetId::new("d1"), OwnerId::new("o1"))
            .with_triggers(vec![trigger.clone()])
            .deployed();
        (workflow, trigger)
    }

    fn trigger_event(workflow: &Workflow, trigger: &Trigger) -> EventPayload {
        EventPayload::WorkflowTrigger(WorkflowTriggerEvent {
            owner_id: workflow.owner_id.clone(),
            workflow_id: workflow.id,
            trigger_id: trigger.id,
        })
    }

    #[tokio::test]
    async fn trigger_event_drives_a_successful_run() {
        let h = scripted_harness();
        let (workflow, trigger) = triggered_workflow();
        let workflow = h.orchestrator.deploy(workflow).await.expect("deploy");

        let (_sub, mut rx) = watch_bus(
            &h.bus,
            &[EventType::WorkflowStarted, EventType::WorkflowStopped],
        );
        h.orchestrator.start().await.expect("start");

        h.bus.publish(trigger_event(&workflow, &trigger));

        let started = recv_event(&mut rx).await;
        let EventPayload::WorkflowStarted(started) = started.payload else {
            panic!("expected WorkflowStarted, got {started:?}");
        };
        assert_eq!(started.workflow_id, workflow.id);

        let stopped = recv_event(&mut rx).await;
        let EventPayload::WorkflowStopped(stopped) = stopped.payload else {
            panic!("expected WorkflowStopped, got {stopped:?}");
        };
        assert_eq!(stopped.workflow_id, workflow.id);
        assert_eq!(stopped.run_id, started.run_id);
        assert_eq!(stopped.status, RunStatus::Succeeded);

        assert_eq!(h.run_store.count(workflow.id).await.expect("count"), 1);
        let latest = h.run_store.get_latest(workflow.id).await.expect("latest");
        assert_eq!(latest.status, RunStatus::Succeeded);

        let stored = h.workflow_store.get(workflow.id).await.expect("get");
        assert_eq!(stored.trigger(trigger.id).expect("trigger").advance_count, 1);
    }

    #[tokio::test]
    async fn deactivated_workflow_ignores_triggers() {
        let h = scripted_harness();
        let (workflow, trigger) = triggered_workflow();
        let workflow = h.orchestrator.deploy(workflow).await.expect("deploy");
        h.orchestrator.start().await.expect("start");

        let (_sub, mut rx) = watch_bus(
            &h.bus,
            &[EventType::WorkflowStarted, EventType::WorkflowStopped],
        );

        // First trigger runs to completion.
        h.bus.publish(trigger_event(&workflow, &trigger));
        recv_event(&mut rx).await; // started
        recv_event(&mut rx).await; // stopped
        let count_before = h.run_store.count(workflow.id).await.expect("count");

        // Undeploy, same trigger again: nothing.
        let mut workflow = h.workflow_store.get(workflow.id).await.expect("get");
        workflow.active = false;
        let workflow = h
            .orchestrator
            .save_workflow(workflow)
            .await
            .expect("save");
        h.bus.publish(trigger_event(&workflow, &trigger));

        assert_no_event(&mut rx).await;
        assert_eq!(
            h.run_store.count(workflow.id).await.expect("count"),
            count_before
        );
    }

    #[tokio::test]
    async fn run_workflow_folds_runner_events_into_state() {
        let h = scripted_harness();
        let (workflow, _trigger) = triggered_workflow();
        let workflow = h.orchestrator.deploy(workflow).await.expect("deploy");

        let run_id = RunId::new();
        let returned = h
            .orchestrator
            .run_workflow(workflow.id, Some(run_id))
            .await
            .expect("run");
        assert_eq!(returned, run_id);

        let state = h.run_store.get(run_id).await.expect("get");
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(state.number, 1);
        assert_eq!(state.steps.len(), 1);

        let step = &state.steps[0];
        assert_eq!(step.name, "s1");
        assert_eq!(step.status, RunStatus::Succeeded);
        assert_eq!(step.output.len(), 1);
        match &step.output[0].payload {
            EventPayload::TransformPrint(TransformMessage { msg }) => assert_eq!(msg, "hi"),
            other => panic!("unexpected step output: {other:?}"),
        }

        assert!(state.start_time.is_some());
        assert!(state.stop_time.is_some());
        assert_eq!(
            state.duration_ns,
            (state.stop_time.unwrap() - state.start_time.unwrap()).num_nanoseconds()
        );
    }

    #[tokio::test]
    async fn runner_failure_is_captured_not_propagated() {
        let h = harness(|_| Arc::new(FailingRunner));
        let (workflow, _trigger) = triggered_workflow();
        let workflow = h.orchestrator.deploy(workflow).await.expect("deploy");

        let (_sub, mut rx) = watch_bus(&h.bus, &[EventType::WorkflowStopped]);

        let run_id = h
            .orchestrator
            .run_workflow(workflow.id, None)
            .await
            .expect("run_workflow itself must not fail");

        let stopped = recv_event(&mut rx).await;
        let EventPayload::WorkflowStopped(stopped) = stopped.payload else {
            panic!("expected WorkflowStopped");
        };
        assert_eq!(stopped.status, RunStatus::Failed);

        let state = h.run_store.get(run_id).await.expect("get");
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn quiet_runner_defaults_to_succeeded() {
        let h = harness(|_| Arc::new(QuietRunner));
        let (workflow, _trigger) = triggered_workflow();
        let workflow = h.orchestrator.deploy(workflow).await.expect("deploy");

        let run_id = h
            .orchestrator
            .run_workflow(workflow.id, None)
            .await
            .expect("run");

        let state = h.run_store.get(run_id).await.expect("get");
        assert_eq!(state.status, RunStatus::Succeeded);
        assert!(state.stop_time.is_some());
    }

    #[tokio::test]
    async fn second_workflow_for_dataset_is_rejected() {
        let h = harness(|_| Arc::new(QuietRunner));
        let first = Workflow::new(DatasetId::new("d"), OwnerId::new("o1"));
        let second = Workflow::new(DatasetId::new("d"), OwnerId::new("o2"));

        h.orchestrator.deploy(first).await.expect("deploy");
        let err = h.orchestrator.deploy(second).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::WorkflowStore(WorkflowStoreError::DatasetExists { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_runs_stay_isolated() {
        let h = scripted_harness();
        let wf1 = h
            .orchestrator
            .deploy(Workflow::new(DatasetId::new("d1"), OwnerId::new("o1")).deployed())
            .await
            .expect("deploy");
        let wf2 = h
            .orchestrator
            .deploy(Workflow::new(DatasetId::new("d2"), OwnerId::new("o1")).deployed())
            .await
            .expect("deploy");

        let run1 = RunId::new();
        let run2 = RunId::new();
        let (a, b) = tokio::join!(
            h.orchestrator.run_workflow(wf1.id, Some(run1)),
            h.orchestrator.run_workflow(wf2.id, Some(run2)),
        );
        a.expect("run 1");
        b.expect("run 2");

        for (workflow, run_id) in [(wf1.id, run1), (wf2.id, run2)] {
            let state = h.run_store.get(run_id).await.expect("get");
            assert_eq!(state.workflow_id, workflow);
            assert_eq!(state.steps.len(), 1, "each run owns exactly its own step");
            assert_eq!(state.status, RunStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn stopped_orchestrator_ignores_triggers() {
        let h = scripted_harness();
        let (workflow, trigger) = triggered_workflow();
        let workflow = h.orchestrator.deploy(workflow).await.expect("deploy");

        h.orchestrator.start().await.expect("start");
        h.orchestrator.stop().await;
        assert!(!h.orchestrator.is_started());

        let (_sub, mut rx) = watch_bus(&h.bus, &[EventType::WorkflowStarted]);
        h.bus.publish(trigger_event(&workflow, &trigger));

        assert_no_event(&mut rx).await;
        let err = h.run_store.count(workflow.id).await.unwrap_err();
        assert!(matches!(err, RunStoreError::UnknownWorkflow { .. }));
    }

    #[tokio::test]
    async fn hooks_fire_after_run_with_advance_recorded() {
        let h = harness(|_| Arc::new(QuietRunner));
        let hook = Hook::webhook("https://example.com/notify");
        let workflow = Workflow::new(DatasetId::new("d1"), OwnerId::new("o1"))
            .with_hooks(vec![hook.clone(), {
                let mut inactive = Hook::publish();
                inactive.active = false;
                inactive
            }])
            .deployed();
        let workflow = h.orchestrator.deploy(workflow).await.expect("deploy");

        let (_sub, mut rx) = watch_bus(&h.bus, &[EventType::HookFired]);
        let run_id = h
            .orchestrator
            .run_workflow(workflow.id, None)
            .await
            .expect("run");

        let fired = recv_event(&mut rx).await;
        let EventPayload::HookFired(fired) = fired.payload else {
            panic!("expected HookFired");
        };
        assert_eq!(fired.hook_id, hook.id);
        assert_eq!(fired.run_id, run_id);
        assert_eq!(fired.status, RunStatus::Succeeded);
        assert_eq!(
            fired.destination.as_deref(),
            Some("https://example.com/notify")
        );

        // Only the active hook fired.
        assert_no_event(&mut rx).await;

        let stored = h.workflow_store.get(workflow.id).await.expect("get");
        assert_eq!(stored.hooks[0].advance_count, 1);
        assert_eq!(stored.hooks[1].advance_count, 0);
    }

    #[tokio::test]
    async fn apply_leaves_no_run_state_and_no_lifecycle_events() {
        let h = harness(|_| Arc::new(QuietRunner));
        let (workflow, _trigger) = triggered_workflow();
        let workflow = h.orchestrator.deploy(workflow).await.expect("deploy");

        let (_sub, mut rx) = watch_bus(
            &h.bus,
            &[EventType::WorkflowStarted, EventType::WorkflowStopped],
        );

        let run_id = h
            .orchestrator
            .apply_workflow(
                true,
                None,
                &workflow,
                serde_json::json!({"body": []}),
                HashMap::new(),
            )
            .await
            .expect("apply");

        assert_eq!(h.applier.calls(), vec![run_id]);
        assert_no_event(&mut rx).await;

        let err = h.run_store.get(run_id).await.unwrap_err();
        assert!(matches!(err, RunStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn run_for_unknown_workflow_fails() {
        let h = harness(|_| Arc::new(QuietRunner));
        let err = h
            .orchestrator
            .run_workflow(WorkflowId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::WorkflowStore(WorkflowStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let h = harness(|_| Arc::new(QuietRunner));
        h.orchestrator.start().await.expect("start");
        h.orchestrator.start().await.expect("second start");
        assert!(h.orchestrator.is_started());
        h.orchestrator.stop().await;
    }
}
