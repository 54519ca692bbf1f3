//! Runtime trigger listener.
//!
//! Runtime triggers fire on request: some surface (CLI, RPC) asks for a
//! workflow to run now. Requests arrive on a bounded channel; the drain
//! task checks each against the watched set and publishes a
//! `WorkflowTrigger` event for known, active entries while the listener
//! is started.

use crate::error::ListenerError;
use crate::listener::Listener;
use crate::trigger::{Trigger, TriggerType};
use crate::workflow::Workflow;
use async_trait::async_trait;
use quarry_core::{OwnerId, TriggerId, WorkflowId};
use quarry_event::{EventBus, EventPayload, WorkflowTriggerEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Default bound of the trigger request channel.
const DEFAULT_REQUEST_CAPACITY: usize = 16;

type WatchedSet = HashMap<(WorkflowId, TriggerId), OwnerId>;

/// Listener for runtime triggers.
pub struct RuntimeListener {
    watched: Arc<Mutex<WatchedSet>>,
    listening: Arc<AtomicBool>,
    requests: mpsc::Sender<WorkflowTriggerEvent>,
}

impl RuntimeListener {
    /// Creates a runtime listener publishing on the given bus.
    ///
    /// Must be called within a tokio runtime: the listener owns a drain
    /// task for its request channel.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self::with_request_capacity(bus, DEFAULT_REQUEST_CAPACITY)
    }

    /// As `new`, with an explicit request channel bound.
    #[must_use]
    pub fn with_request_capacity(bus: EventBus, capacity: usize) -> Self {
        let (requests, mut receiver) = mpsc::channel::<WorkflowTriggerEvent>(capacity.max(1));
        let watched: Arc<Mutex<WatchedSet>> = Arc::new(Mutex::new(HashMap::new()));
        let listening = Arc::new(AtomicBool::new(false));

        let drain_watched = Arc::clone(&watched);
        let drain_listening = Arc::clone(&listening);
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                if !drain_listening.load(Ordering::SeqCst) {
                    // Stopped listeners swallow requests.
                    continue;
                }

                let known = {
                    let watched = drain_watched
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    watched.get(&(request.workflow_id, request.trigger_id))
                        == Some(&request.owner_id)
                };

                if known {
                    bus.publish(EventPayload::WorkflowTrigger(request));
                } else {
                    tracing::debug!(
                        workflow_id = %request.workflow_id,
                        trigger_id = %request.trigger_id,
                        "ignoring trigger request for unwatched trigger"
                    );
                }
            }
        });

        Self {
            watched,
            listening,
            requests,
        }
    }

    /// Returns a sender for trigger requests. The surface driving manual
    /// runs holds one of these.
    #[must_use]
    pub fn trigger_sender(&self) -> mpsc::Sender<WorkflowTriggerEvent> {
        self.requests.clone()
    }

    fn locked(&self) -> MutexGuard<'_, WatchedSet> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Listener for RuntimeListener {
    fn listens_for(&self) -> TriggerType {
        TriggerType::Runtime
    }

    async fn connect_trigger(
        &self,
        workflow: &Workflow,
        trigger: &Trigger,
    ) -> Result<(), ListenerError> {
        if trigger.trigger_type() != TriggerType::Runtime {
            return Err(ListenerError::TriggerTypeMismatch {
                expected: TriggerType::Runtime,
                got: trigger.trigger_type(),
            });
        }
        if workflow.owner_id.is_empty() {
            return Err(ListenerError::EmptyOwnerId {
                workflow_id: workflow.id,
            });
        }

        self.locked()
            .insert((workflow.id, trigger.id), workflow.owner_id.clone());
        Ok(())
    }

    async fn disconnect_trigger(&self, workflow_id: WorkflowId, trigger_id: TriggerId) {
        self.locked().remove(&(workflow_id, trigger_id));
    }

    async fn watched_triggers(&self, workflow_id: WorkflowId) -> Vec<TriggerId> {
        self.locked()
            .keys()
            .filter(|(wid, _)| *wid == workflow_id)
            .map(|(_, tid)| *tid)
            .collect()
    }

    async fn start(&self) -> Result<(), ListenerError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyStarted);
        }
        Ok(())
    }

    async fn stop(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::DatasetId;
    use quarry_event::{Event, EventHandler, EventType, HandlerError};
    use std::time::Duration;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

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

    fn watch_bus(bus: &EventBus) -> (quarry_event::Subscription, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = bus.subscribe_types(Arc::new(Collector { tx }), &[EventType::WorkflowTrigger]);
        (sub, rx)
    }

    fn deployed_workflow() -> (Workflow, Trigger) {
        let trigger = Trigger::runtime();
        let workflow = Workflow::new(DatasetId::new("d1"), OwnerId::new("o1"))
            .with_triggers(vec![trigger.clone()])
            .deployed();
        (workflow, trigger)
    }

    fn request(workflow: &Workflow, trigger: &Trigger) -> WorkflowTriggerEvent {
        WorkflowTriggerEvent {
            owner_id: workflow.owner_id.clone(),
            workflow_id: workflow.id,
            trigger_id: trigger.id,
        }
    }

    #[tokio::test]
    async fn started_listener_publishes_watched_requests() {
        let bus = EventBus::new();
        let (_sub, mut rx) = watch_bus(&bus);

        let listener = RuntimeListener::new(bus);
        let (workflow, trigger) = deployed_workflow();
        listener.update_triggers(&workflow).await.expect("reconcile");
        listener.start().await.expect("start");

        listener
            .trigger_sender()
            .send(request(&workflow, &trigger))
            .await
            .expect("send");

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(event.event_type(), EventType::WorkflowTrigger);
    }

    #[tokio::test]
    async fn stopped_listener_swallows_requests() {
        let bus = EventBus::new();
        let (_sub, mut rx) = watch_bus(&bus);

        let listener = RuntimeListener::new(bus);
        let (workflow, trigger) = deployed_workflow();
        listener.update_triggers(&workflow).await.expect("reconcile");
        // Never started.

        listener
            .trigger_sender()
            .send(request(&workflow, &trigger))
            .await
            .expect("send");

        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "expected no event");
    }

    #[tokio::test]
    async fn unwatched_requests_are_ignored() {
        let bus = EventBus::new();
        let (_sub, mut rx) = watch_bus(&bus);

        let listener = RuntimeListener::new(bus);
        listener.start().await.expect("start");

        let (workflow, trigger) = deployed_workflow();
        listener
            .trigger_sender()
            .send(request(&workflow, &trigger))
            .await
            .expect("send");

        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "expected no event");
    }

    #[tokio::test]
    async fn update_triggers_reconciles_watched_set() {
        let listener = RuntimeListener::new(EventBus::inert());
        let (mut workflow, _trigger) = deployed_workflow();

        listener.update_triggers(&workflow).await.expect("reconcile");
        assert!(listener.triggers_exist(&workflow).await);

        // Undeploying detaches everything.
        workflow.active = false;
        listener.update_triggers(&workflow).await.expect("reconcile");
        assert!(listener.watched_triggers(workflow.id).await.is_empty());
    }

    #[tokio::test]
    async fn update_triggers_detaches_deactivated_trigger() {
        let listener = RuntimeListener::new(EventBus::inert());
        let (mut workflow, trigger) = deployed_workflow();

        listener.update_triggers(&workflow).await.expect("reconcile");

        workflow
            .trigger_mut(trigger.id)
            .expect("trigger")
            .active = false;
        listener.update_triggers(&workflow).await.expect("reconcile");
        assert!(listener.watched_triggers(workflow.id).await.is_empty());
    }

    #[tokio::test]
    async fn update_triggers_requires_owner() {
        let listener = RuntimeListener::new(EventBus::inert());
        let (mut workflow, _trigger) = deployed_workflow();
        workflow.owner_id = OwnerId::default();

        let err = listener.update_triggers(&workflow).await.unwrap_err();
        assert_eq!(
            err,
            ListenerError::EmptyOwnerId {
                workflow_id: workflow.id
            }
        );
    }

    #[tokio::test]
    async fn connect_rejects_wrong_trigger_kind() {
        let listener = RuntimeListener::new(EventBus::inert());
        let (workflow, _trigger) = deployed_workflow();
        let cron = Trigger::cron(
            crate::interval::RepeatingInterval::parse("R/PT1H").expect("parse"),
        );

        let err = listener.connect_trigger(&workflow, &cron).await.unwrap_err();
        assert_eq!(
            err,
            ListenerError::TriggerTypeMismatch {
                expected: TriggerType::Runtime,
                got: TriggerType::Cron,
            }
        );
    }

    #[tokio::test]
    async fn double_start_fails() {
        let listener = RuntimeListener::new(EventBus::inert());
        listener.start().await.expect("start");
        assert_eq!(
            listener.start().await.unwrap_err(),
            ListenerError::AlreadyStarted
        );

        listener.stop().await;
        listener.start().await.expect("restart");
    }
}
