//! Hook descriptors for post-run notification.
//!
//! Hooks are the structural mirror of triggers: tagged descriptors with
//! an activation flag and an advance counter, but fired by the
//! orchestrator when a run terminates instead of firing runs themselves.
//! Firing a hook publishes a `HookFired` event on the bus; carrying the
//! notification to the outside world is the subscriber's job.

use crate::error::DecodeError;
use quarry_core::{DatasetId, HookId, RunId, RunStatus, WorkflowId};
use quarry_event::HookEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The kind of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    /// Announce run completion on the bus with no destination.
    Publish,
    /// Announce run completion with a webhook destination URL.
    Webhook,
}

impl HookType {
    /// Resolves a serialized type tag to a registered kind.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "publish" => Some(Self::Publish),
            "webhook" => Some(Self::Webhook),
            _ => None,
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish => f.write_str("publish"),
            Self::Webhook => f.write_str("webhook"),
        }
    }
}

/// Kind-specific hook configuration, dispatched on the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookConfig {
    /// Bus-only announcement.
    Publish,
    /// Webhook announcement.
    Webhook {
        /// Destination URL for whatever delivers the notification.
        url: String,
    },
}

impl HookConfig {
    /// Returns the hook kind.
    #[must_use]
    pub fn hook_type(&self) -> HookType {
        match self {
            Self::Publish => HookType::Publish,
            Self::Webhook { .. } => HookType::Webhook,
        }
    }
}

/// A hook descriptor attached to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    /// Unique identifier within the owning workflow.
    pub id: HookId,
    /// Whether the hook fires on run completion.
    #[serde(default)]
    pub active: bool,
    /// How many times this hook has fired. Audit only.
    #[serde(default)]
    pub advance_count: u64,
    /// Kind-specific configuration.
    #[serde(flatten)]
    pub config: HookConfig,
}

impl Hook {
    /// Creates an active hook with a fresh ID.
    #[must_use]
    pub fn new(config: HookConfig) -> Self {
        Self {
            id: HookId::new(),
            active: true,
            advance_count: 0,
            config,
        }
    }

    /// Creates an active bus-announcement hook.
    #[must_use]
    pub fn publish() -> Self {
        Self::new(HookConfig::Publish)
    }

    /// Creates an active webhook hook.
    #[must_use]
    pub fn webhook(url: impl Into<String>) -> Self {
        Self::new(HookConfig::Webhook { url: url.into() })
    }

    /// Returns the hook kind.
    #[must_use]
    pub fn hook_type(&self) -> HookType {
        self.config.hook_type()
    }

    /// Records that this hook fired.
    pub fn advance(&mut self) {
        self.advance_count += 1;
    }

    /// Builds the event this hook publishes for a terminated run.
    #[must_use]
    pub fn event(
        &self,
        dataset_id: DatasetId,
        workflow_id: WorkflowId,
        run_id: RunId,
        status: RunStatus,
    ) -> HookEvent {
        let destination = match &self.config {
            HookConfig::Publish => None,
            HookConfig::Webhook { url } => Some(url.clone()),
        };
        HookEvent {
            hook_id: self.id,
            hook_type: self.hook_type().to_string(),
            dataset_id,
            workflow_id,
            run_id,
            status,
            destination,
        }
    }
}

/// Decodes a raw descriptor into a hook, dispatching on its `type` tag.
///
/// # Errors
///
/// Returns `MissingTag` when no tag is present, `UnexpectedType` for an
/// unregistered tag, and `Malformed` when the body does not parse.
pub fn decode_hook(value: &JsonValue) -> Result<Hook, DecodeError> {
    let tag = value
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or(DecodeError::MissingTag)?;

    if HookType::from_tag(tag).is_none() {
        return Err(DecodeError::UnexpectedType {
            tag: tag.to_string(),
        });
    }

    serde_json::from_value(value.clone()).map_err(|e| DecodeError::Malformed {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_hook_serde_roundtrip() {
        let hook = Hook::publish();
        let json = serde_json::to_value(&hook).expect("serialize");
        assert_eq!(json["type"], "publish");

        let parsed: Hook = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, hook);
    }

    #[test]
    fn webhook_hook_serde_roundtrip() {
        let hook = Hook::webhook("https://example.com/notify");
        let json = serde_json::to_value(&hook).expect("serialize");
        assert_eq!(json["type"], "webhook");
        assert_eq!(json["url"], "https://example.com/notify");

        let parsed: Hook = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, hook);
    }

    #[test]
    fn webhook_event_carries_destination() {
        let hook = Hook::webhook("https://example.com/notify");
        let event = hook.event(
            DatasetId::new("d1"),
            WorkflowId::new(),
            RunId::new(),
            RunStatus::Succeeded,
        );

        assert_eq!(event.hook_id, hook.id);
        assert_eq!(event.hook_type, "webhook");
        assert_eq!(event.status, RunStatus::Succeeded);
        assert_eq!(
            event.destination,
            Some("https://example.com/notify".to_string())
        );
    }

    #[test]
    fn publish_event_has_no_destination() {
        let hook = Hook::publish();
        let event = hook.event(
            DatasetId::new("d1"),
            WorkflowId::new(),
            RunId::new(),
            RunStatus::Failed,
        );
        assert_eq!(event.destination, None);
    }

    #[test]
    fn advance_increments_count() {
        let mut hook = Hook::publish();
        hook.advance();
        assert_eq!(hook.advance_count, 1);
    }

    #[test]
    fn decode_unknown_tag_fails() {
        let value = serde_json::json!({"id": HookId::new(), "type": "smoke_signal"});
        let err = decode_hook(&value).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnexpectedType {
                tag: "smoke_signal".to_string()
            }
        );
    }

    #[test]
    fn decode_registered_tag() {
        let hook = Hook::webhook("https://example.com/n");
        let value = serde_json::to_value(&hook).expect("serialize");
        let decoded = decode_hook(&value).expect("decode");
        assert_eq!(decoded, hook);
    }
}
