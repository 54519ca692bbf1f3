//! In-process event bus.
//!
//! The bus fans events out to subscribers without ever blocking the
//! publisher:
//!
//! - Each subscription owns a bounded queue drained by a dedicated worker
//!   task that invokes the handler
//! - `publish` performs a non-blocking send to each matching queue; a full
//!   queue drops the event for that subscriber and records it in the
//!   dropped-event counter
//! - Events published from a single task reach each subscriber in publish
//!   order; no ordering holds across publishers
//! - Handler errors are logged and dropped, never surfaced to publishers

use crate::event::{Event, EventPayload, EventType};
use async_trait::async_trait;
use quarry_core::RunId;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Default bound of each subscriber's event queue.
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Error returned by an event handler.
///
/// The bus logs these and moves on; they exist so handlers can report
/// failure without panicking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// What went wrong.
    pub message: String,
}

impl HandlerError {
    /// Creates a handler error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event handler failed: {}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Trait for event subscribers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles a single delivered event.
    async fn handle_event(&self, event: Event) -> Result<(), HandlerError>;
}

/// Which events a subscription receives.
#[derive(Debug, Clone)]
enum SubscriptionFilter {
    /// Every event.
    All,
    /// Events whose type is in the set.
    Types(HashSet<EventType>),
    /// Events belonging to a single run.
    Session(RunId),
}

impl SubscriptionFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Types(types) => types.contains(&event.event_type()),
            Self::Session(run_id) => event.session_id.as_ref() == Some(run_id),
        }
    }
}

/// A registered subscriber: its filter, queue, and in-flight counter.
struct Subscriber {
    id: u64,
    filter: SubscriptionFilter,
    sender: mpsc::Sender<Event>,
    inflight: Arc<AtomicU64>,
}

struct BusState {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    dropped: AtomicU64,
}

impl BusState {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The in-process event bus. Clones share the same subscriber registry.
#[derive(Clone)]
pub struct EventBus {
    state: Option<Arc<BusState>>,
}

impl EventBus {
    /// Creates a bus with the default per-subscriber queue capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a bus with the given per-subscriber queue capacity.
    #[must_use]
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            state: Some(Arc::new(BusState {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                queue_capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            })),
        }
    }

    /// Creates the inert bus: publishes are accepted and discarded, and
    /// subscriptions are never delivered to.
    #[must_use]
    pub fn inert() -> Self {
        Self { state: None }
    }

    /// Returns true for the inert bus.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.state.is_none()
    }

    /// Subscribes the handler to every event.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Subscription {
        self.add_subscriber(SubscriptionFilter::All, handler)
    }

    /// Subscribes the handler to events of the given types.
    pub fn subscribe_types(
        &self,
        handler: Arc<dyn EventHandler>,
        types: &[EventType],
    ) -> Subscription {
        let types = types.iter().copied().collect();
        self.add_subscriber(SubscriptionFilter::Types(types), handler)
    }

    /// Subscribes the handler to events belonging to a single run.
    pub fn subscribe_session(
        &self,
        handler: Arc<dyn EventHandler>,
        session_id: RunId,
    ) -> Subscription {
        self.add_subscriber(SubscriptionFilter::Session(session_id), handler)
    }

    fn add_subscriber(
        &self,
        filter: SubscriptionFilter,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let Some(state) = &self.state else {
            return Subscription::inert();
        };

        let (sender, mut receiver) = mpsc::channel::<Event>(state.queue_capacity);
        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        let inflight = Arc::new(AtomicU64::new(0));

        let worker_inflight = Arc::clone(&inflight);
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = handler.handle_event(event).await {
                    tracing::warn!(error = %e, "event handler failed");
                }
                worker_inflight.fetch_sub(1, Ordering::Relaxed);
            }
        });

        state.subscribers().push(Subscriber {
            id,
            filter,
            sender,
            inflight,
        });

        Subscription {
            id,
            state: Arc::downgrade(state),
            worker: Some(worker),
        }
    }

    /// Publishes an event with no session, stamped with the current time.
    pub fn publish(&self, payload: EventPayload) {
        self.fan_out(Event::now(payload));
    }

    /// Publishes an event belonging to the given run.
    pub fn publish_for(&self, session_id: RunId, payload: EventPayload) {
        self.fan_out(Event::for_session(session_id, payload));
    }

    fn fan_out(&self, event: Event) {
        let Some(state) = &self.state else { return };

        let mut subscribers = state.subscribers();
        for subscriber in subscribers.iter() {
            if !subscriber.filter.matches(&event) {
                continue;
            }

            subscriber.inflight.fetch_add(1, Ordering::Relaxed);
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    subscriber.inflight.fetch_sub(1, Ordering::Relaxed);
                    state.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event_type = %event.event_type(),
                        "subscriber queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    subscriber.inflight.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        subscribers.retain(|s| !s.sender.is_closed());
    }

    /// Number of events dropped because a subscriber queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.state
            .as_ref()
            .map_or(0, |s| s.dropped.load(Ordering::Relaxed))
    }

    /// Waits until every subscriber has drained its queue and finished
    /// handling everything published so far.
    ///
    /// Only events already published are waited on; callers racing with
    /// other publishers should bound this with a timeout.
    pub async fn settled(&self) {
        let Some(state) = &self.state else { return };
        loop {
            let pending: u64 = state
                .subscribers()
                .iter()
                .map(|s| s.inflight.load(Ordering::Relaxed))
                .sum();
            if pending == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an active subscription.
///
/// Dropping (or explicitly cancelling) the handle ceases delivery: the
/// subscriber is removed from the registry and its worker task is aborted.
pub struct Subscription {
    id: u64,
    state: Weak<BusState>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            id: 0,
            state: Weak::new(),
            worker: None,
        }
    }

    /// Cancels the subscription.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.subscribers().retain(|s| s.id != self.id);
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}
