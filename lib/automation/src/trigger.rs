//! Trigger descriptors for workflow initiation.
//!
//! A trigger describes a condition under which its workflow should run.
//! Descriptors are polymorphic over a `type` tag so stored workflows can
//! carry any registered kind; the two kinds the core ships are runtime
//! triggers (fired on request through the runtime listener) and cron
//! triggers (fired on an ISO-8601 repeating interval).

use crate::error::DecodeError;
use crate::interval::RepeatingInterval;
use chrono::{DateTime, Utc};
use quarry_core::TriggerId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The kind of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fired on request while the orchestrator is running.
    Runtime,
    /// Fired on a repeating interval.
    Cron,
}

impl TriggerType {
    /// Resolves a serialized type tag to a registered kind.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "runtime" => Some(Self::Runtime),
            "cron" => Some(Self::Cron),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime => f.write_str("runtime"),
            Self::Cron => f.write_str("cron"),
        }
    }
}

/// Kind-specific trigger configuration, dispatched on the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Runtime trigger: no configuration beyond the common fields.
    Runtime,
    /// Cron trigger.
    Cron {
        /// The repeating interval the trigger fires on.
        periodicity: RepeatingInterval,
        /// The next instant the trigger is due, maintained as the trigger
        /// advances.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_run_start: Option<DateTime<Utc>>,
    },
}

impl TriggerConfig {
    /// Returns the trigger kind.
    #[must_use]
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Runtime => TriggerType::Runtime,
            Self::Cron { .. } => TriggerType::Cron,
        }
    }
}

/// A trigger descriptor attached to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Unique identifier within the owning workflow.
    pub id: TriggerId,
    /// Whether the trigger participates in listener dispatch.
    #[serde(default)]
    pub active: bool,
    /// How many runs this trigger has started. Audit only; never used for
    /// scheduling decisions.
    #[serde(default)]
    pub advance_count: u64,
    /// Kind-specific configuration.
    #[serde(flatten)]
    pub config: TriggerConfig,
}

impl Trigger {
    /// Creates an active trigger with a fresh ID.
    #[must_use]
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            id: TriggerId::new(),
            active: true,
            advance_count: 0,
            config,
        }
    }

    /// Creates an active runtime trigger.
    #[must_use]
    pub fn runtime() -> Self {
        Self::new(TriggerConfig::Runtime)
    }

    /// Creates an active cron trigger due at the interval's first
    /// occurrence from now.
    #[must_use]
    pub fn cron(periodicity: RepeatingInterval) -> Self {
        let next_run_start = periodicity.next_after(Utc::now());
        Self::new(TriggerConfig::Cron {
            periodicity,
            next_run_start,
        })
    }

    /// Returns the trigger kind.
    #[must_use]
    pub fn trigger_type(&self) -> TriggerType {
        self.config.trigger_type()
    }

    /// Records that this trigger started a run.
    ///
    /// Cron triggers also roll their due time forward so a re-deployed
    /// workflow does not immediately re-fire.
    pub fn advance(&mut self) {
        self.advance_count += 1;
        if let TriggerConfig::Cron {
            periodicity,
            next_run_start,
        } = &mut self.config
        {
            *next_run_start = periodicity.next_after(Utc::now());
        }
    }
}

/// Decodes a raw descriptor into a trigger, dispatching on its `type` tag.
///
/// # Errors
///
/// Returns `MissingTag` when no tag is present, `UnexpectedType` for an
/// unregistered tag, and `Malformed` when the body does not parse.
pub fn decode_trigger(value: &JsonValue) -> Result<Trigger, DecodeError> {
    let tag = value
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or(DecodeError::MissingTag)?;

    if TriggerType::from_tag(tag).is_none() {
        return Err(DecodeError::UnexpectedType {
            tag: tag.to_string(),
        });
    }

    serde_json::from_value(value.clone()).map_err(|e| DecodeError::Malformed {
        reason: e.to_string(),
    })
}
