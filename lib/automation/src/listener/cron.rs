//! Cron trigger listener.
//!
//! Cron triggers fire on ISO-8601 repeating intervals. The listener
//! polls a ticker at a fixed check interval; every watched trigger whose
//! due time has passed gets a `WorkflowTrigger` event published, and its
//! due time rolled forward to the next occurrence.

use crate::error::ListenerError;
use crate::interval::RepeatingInterval;
use crate::listener::Listener;
use crate::trigger::{Trigger, TriggerConfig, TriggerType};
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_core::{OwnerId, TriggerId, WorkflowId};
use quarry_event::{EventBus, EventPayload, WorkflowTriggerEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often the listener checks for due triggers.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// One watched cron trigger.
#[derive(Debug, Clone)]
pub struct CronEntry {
    /// Owner of the workflow the trigger belongs to.
    pub owner_id: OwnerId,
    /// The trigger's repeating interval.
    pub periodicity: RepeatingInterval,
    /// The next instant the trigger is due.
    pub next_run_start: Option<DateTime<Utc>>,
}

type WatchedSet = HashMap<(WorkflowId, TriggerId), CronEntry>;

/// Listener for cron triggers.
pub struct CronListener {
    bus: EventBus,
    check_interval: Duration,
    watched: Arc<Mutex<WatchedSet>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl CronListener {
    /// Creates a cron listener publishing on the given bus, checking for
    /// due triggers once a second.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self::with_check_interval(bus, DEFAULT_CHECK_INTERVAL)
    }

    /// As `new`, with an explicit check interval.
    #[must_use]
    pub fn with_check_interval(bus: EventBus, check_interval: Duration) -> Self {
        Self {
            bus,
            check_interval,
            watched: Arc::new(Mutex::new(HashMap::new())),
            ticker: Mutex::new(None),
        }
    }

    /// Snapshot of the watched set, for inspection.
    #[must_use]
    pub fn watched(&self) -> HashMap<(WorkflowId, TriggerId), CronEntry> {
        self.locked().clone()
    }

    fn locked(&self) -> MutexGuard<'_, WatchedSet> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticker_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collects the due triggers and rolls their due times forward.
    fn take_due(watched: &Arc<Mutex<WatchedSet>>, now: DateTime<Utc>) -> Vec<WorkflowTriggerEvent> {
        let mut watched = watched.lock().unwrap_or_else(PoisonError::into_inner);
        watched
            .iter_mut()
            .filter_map(|((workflow_id, trigger_id), entry)| match entry.next_run_start {
                Some(due) if due <= now => {
                    entry.next_run_start = entry.periodicity.next_after(now);
                    Some(WorkflowTriggerEvent {
                        owner_id: entry.owner_id.clone(),
                        workflow_id: *workflow_id,
                        trigger_id: *trigger_id,
                    })
                }
                _ => None,
            })
            .collect()
    }
}

impl Drop for CronListener {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker_slot().take() {
            ticker.abort();
        }
    }
}

#[async_trait]
impl Listener for CronListener {
    fn listens_for(&self) -> TriggerType {
        TriggerType::Cron
    }

    async fn connect_trigger(
        &self,
        workflow: &Workflow,
        trigger: &Trigger,
    ) -> Result<(), ListenerError> {
        let TriggerConfig::Cron {
            periodicity,
            next_run_start,
        } = &trigger.config
        else {
            return Err(ListenerError::TriggerTypeMismatch {
                expected: TriggerType::Cron,
                got: trigger.trigger_type(),
            });
        };
        if workflow.owner_id.is_empty() {
            return Err(ListenerError::EmptyOwnerId {
                workflow_id: workflow.id,
            });
        }

        // A missed due time fires at the next tick; only a missing one is
        // recomputed.
        let next_run_start = next_run_start.or_else(|| periodicity.next_after(Utc::now()));
        self.locked().insert(
            (workflow.id, trigger.id),
            CronEntry {
                owner_id: workflow.owner_id.clone(),
                periodicity: periodicity.clone(),
                next_run_start,
            },
        );
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
        let mut slot = self.ticker_slot();
        if slot.is_some() {
            return Err(ListenerError::AlreadyStarted);
        }

        let bus = self.bus.clone();
        let watched = Arc::clone(&self.watched);
        let check_interval = self.check_interval;
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(check_interval);
            loop {
                tick.tick().await;
                let due = Self::take_due(&watched, Utc::now());
                for event in due {
                    bus.publish(EventPayload::WorkflowTrigger(event));
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        if let Some(ticker) = self.ticker_slot().take() {
            ticker.abort();
        }
    }
}
