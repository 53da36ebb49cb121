//! Subscription data model and wire shapes.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use resub_core::{ChangeType, CompressionAlgorithm, Fragments, UriPattern};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::error::SubscriptionError;

/// Opaque caller context handed to the authorizer. Never interpreted by the engine.
pub type UserContext = serde_json::Map<String, Value>;

/// A client's standing request to be notified about matching resources.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub connection_id: String,
    pub uri_pattern: String,
    pattern: UriPattern,
    /// Used only by listing, never by matching
    pub cursor: Option<String>,
    /// Resolved field list after fragment expansion; `None` means full payload
    pub fields: Option<Vec<String>>,
    pub created_at: OffsetDateTime,
    pub user_context: UserContext,
    last_notified_at: Mutex<Option<OffsetDateTime>>,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        connection_id: String,
        pattern: UriPattern,
        cursor: Option<String>,
        fields: Option<Vec<String>>,
        user_context: UserContext,
    ) -> Self {
        Self {
            id,
            connection_id,
            uri_pattern: pattern.as_str().to_string(),
            pattern,
            cursor,
            fields,
            created_at: OffsetDateTime::now_utc(),
            user_context,
            last_notified_at: Mutex::new(None),
        }
    }

    pub fn pattern(&self) -> &UriPattern {
        &self.pattern
    }

    pub fn matches(&self, uri: &str) -> bool {
        self.pattern.matches(uri)
    }

    pub fn last_notified_at(&self) -> Option<OffsetDateTime> {
        *self.last_notified_at.lock()
    }

    pub(crate) fn mark_notified(&self, at: OffsetDateTime) {
        *self.last_notified_at.lock() = Some(at);
    }

    /// Last notification time, or creation time if never notified.
    pub fn last_activity(&self) -> OffsetDateTime {
        self.last_notified_at().unwrap_or(self.created_at)
    }

    pub fn is_expired(&self, ttl: Duration, now: OffsetDateTime) -> bool {
        now - self.last_activity() > ttl
    }
}

/// Everything needed to create one subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(alias = "uri")]
    pub uri_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragments: Option<Fragments>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Label echoed back in batch results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl SubscriptionRequest {
    pub fn new(uri_pattern: impl Into<String>) -> Self {
        Self {
            uri_pattern: uri_pattern.into(),
            ..Default::default()
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_fragments(mut self, fragments: Fragments) -> Self {
        self.fragments = Some(fragments);
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name used in batch reports; unnamed requests are labelled by position.
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("subscription_{index}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemStatus {
    Created,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    pub status: BatchItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Partial-success report of a batch subscribe. Results follow input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSubscribeReport {
    pub total_requested: usize,
    pub total_created: usize,
    pub total_failed: usize,
    pub results: Vec<BatchItemResult>,
}

impl BatchSubscribeReport {
    pub(crate) fn push(&mut self, name: String, outcome: Result<String, SubscriptionError>) {
        self.total_requested += 1;
        let item = match outcome {
            Ok(id) => {
                self.total_created += 1;
                BatchItemResult {
                    name,
                    subscription_id: Some(id),
                    status: BatchItemStatus::Created,
                    error: None,
                }
            }
            Err(e) => {
                self.total_failed += 1;
                BatchItemResult {
                    name,
                    subscription_id: None,
                    status: BatchItemStatus::Failed,
                    error: Some(e.to_string()),
                }
            }
        };
        self.results.push(item);
    }

    pub fn created(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.results
            .iter()
            .filter(|r| r.status == BatchItemStatus::Created)
    }

    pub fn failed(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.results
            .iter()
            .filter(|r| r.status == BatchItemStatus::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchUnsubscribeReport {
    pub removed: Vec<String>,
    pub not_found: Vec<String>,
}

/// What the caller wants to do with a URI, as seen by the authorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Subscribe,
    Read,
}

/// Per-subscription delivery states. Failure at any stage only fails that delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryStage {
    Idle = 0,
    Matching = 1,
    Projecting = 2,
    Transforming = 3,
    Compressing = 4,
    Delivering = 5,
    Failed = 6,
}

impl DeliveryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStage::Idle => "idle",
            DeliveryStage::Matching => "matching",
            DeliveryStage::Projecting => "projecting",
            DeliveryStage::Transforming => "transforming",
            DeliveryStage::Compressing => "compressing",
            DeliveryStage::Delivering => "delivering",
            DeliveryStage::Failed => "failed",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => DeliveryStage::Matching,
            2 => DeliveryStage::Projecting,
            3 => DeliveryStage::Transforming,
            4 => DeliveryStage::Compressing,
            5 => DeliveryStage::Delivering,
            6 => DeliveryStage::Failed,
            _ => DeliveryStage::Idle,
        }
    }
}

impl fmt::Display for DeliveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Params of a `notifications/resources/updated` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpdatedParams {
    pub uri: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    /// Projected and transformed payload, or base64 gzip when `compressed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_type: Option<CompressionAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<usize>,
}
