//! Typed event model and in-process event bus for quarry automation.
//!
//! This crate provides:
//!
//! - **Event Model**: A closed set of event types with typed payloads,
//!   stamped with a timestamp and an optional session (run) identifier
//! - **Event Bus**: In-process pub/sub with per-subscriber worker tasks,
//!   bounded queues, and type/session-filtered subscriptions

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventHandler, HandlerError, Subscription};
pub use event::{
    Event, EventPayload, EventType, HookEvent, TransformLifecycle, TransformMessage,
    TransformStepLifecycle, WorkflowStartedEvent, WorkflowStoppedEvent, WorkflowTriggerEvent,
};
