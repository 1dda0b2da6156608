//! Dispatch subscription model.

use chrono::{DateTime, Utc};
use quepasa_core::options::WhatsappOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery transport of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberKind {
    #[default]
    Webhook,
    Queue,
}

impl std::fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SubscriberKind::Webhook => "webhook",
            SubscriberKind::Queue => "queue",
        })
    }
}

/// One outbound delivery target. The `(wid, connection_string)` pair is
/// unique per tenant; persisted in the `dispatching` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchSubscription {
    /// Owning tenant device id.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub wid: String,
    /// Webhook URL or AMQP URI.
    #[serde(rename = "url")]
    pub connection_string: String,
    #[serde(rename = "type", default)]
    pub kind: SubscriberKind,
    /// Forward messages this gateway originated (API sends).
    #[serde(rename = "forwardinternal", default)]
    pub forward_internal: bool,
    /// Correlation filter: when non-empty, only messages with an exactly
    /// equal track id pass.
    #[serde(rename = "trackid", default, skip_serializing_if = "String::is_empty")]
    pub track_id: String,
    #[serde(flatten)]
    pub options: WhatsappOptions,
    /// Opaque JSON echoed to the subscriber, byte-preserving.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    /// Last delivery failure instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<DateTime<Utc>>,
    /// Last delivery success instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Consecutive failures since the last success.
    #[serde(default)]
    pub age: u32,
}

impl DispatchSubscription {
    /// A subscriber is failing when its consecutive-failure count crossed
    /// the operator threshold. Failing subscribers are flagged, never
    /// silently removed.
    pub fn is_failing(&self, max_age: u32) -> bool {
        self.age >= max_age
    }

    pub fn is_failure_more_recent(&self) -> bool {
        match (self.failure, self.success) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(f), Some(s)) => f > s,
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.success = Some(at);
        self.timestamp = Some(at);
        self.age = 0;
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.failure = Some(at);
        self.timestamp = Some(at);
        self.age = self.age.saturating_add(1);
    }
}
