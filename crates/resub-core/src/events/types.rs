//! Resource change event types.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Kind of change that happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Resource was created
    Created,
    /// Resource was updated
    Updated,
    /// Resource was deleted
    Deleted,
}

impl ChangeType {
    /// Returns the wire representation of the change type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A change to one concrete resource.
///
/// Immutable once constructed; the dispatcher consumes it and drops it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Type of change (created, updated, deleted)
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// Concrete resource URI (no wildcards)
    pub uri: String,
    /// Time of the change
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Full or partial resource body. When absent the dispatcher reads the
    /// current state through the resource provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Instance that first published the change (distributed mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ResourceChange {
    pub fn new(
        change_type: ChangeType,
        uri: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            change_type,
            uri: uri.into(),
            timestamp: OffsetDateTime::now_utc(),
            payload,
            origin: None,
        }
    }

    pub fn created(uri: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(ChangeType::Created, uri, Some(payload))
    }

    pub fn updated(uri: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(ChangeType::Updated, uri, Some(payload))
    }

    pub fn deleted(uri: impl Into<String>) -> Self {
        Self::new(ChangeType::Deleted, uri, None)
    }

    /// An update without a body; subscribers get the current state read
    /// through the resource provider.
    pub fn touched(uri: impl Into<String>) -> Self {
        Self::new(ChangeType::Updated, uri, None)
    }

    pub fn with_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// A change must name a single resource, never a pattern.
    pub fn is_concrete(&self) -> bool {
        !self.uri.is_empty() && !self.uri.contains('*')
    }
}
