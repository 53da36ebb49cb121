//! Collaborators the engine consumes: resource reads and authorization.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use resub_core::{ChangeType, ResourceChange};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Action, UserContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
            mime_type: None,
        }
    }
}

/// Source of resource listings and current resource state.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<ResourceDescriptor>>;

    /// Current state of a resource, `None` when it does not exist.
    async fn read(&self, uri: &str) -> anyhow::Result<Option<Value>>;
}

/// Decides whether a caller may subscribe to or read a URI.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, user_context: &UserContext, uri: &str, action: Action) -> bool;
}

/// Authorizer that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _user_context: &UserContext, _uri: &str, _action: Action) -> bool {
        true
    }
}

/// In-memory resource store kept in sync with published changes.
#[derive(Debug, Default)]
pub struct MemoryResourceProvider {
    resources: DashMap<String, Value>,
}

impl MemoryResourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn put(&self, uri: impl Into<String>, value: Value) {
        self.resources.insert(uri.into(), value);
    }

    pub fn remove(&self, uri: &str) -> bool {
        self.resources.remove(uri).is_some()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Mirror a change. Changes without payload leave the stored state untouched.
    pub fn apply(&self, change: &ResourceChange) {
        match change.change_type {
            ChangeType::Deleted => {
                self.remove(&change.uri);
            }
            ChangeType::Created | ChangeType::Updated => {
                if let Some(payload) = &change.payload {
                    self.put(change.uri.clone(), payload.clone());
                }
            }
        }
    }
}

#[async_trait]
impl ResourceProvider for MemoryResourceProvider {
    async fn list(&self) -> anyhow::Result<Vec<ResourceDescriptor>> {
        let mut resources: Vec<ResourceDescriptor> = self
            .resources
            .iter()
            .map(|entry| {
                let uri = entry.key().clone();
                let name = uri
                    .rsplit('/')
                    .next()
                    .filter(|n| !n.is_empty())
                    .map(str::to_string);
                ResourceDescriptor {
                    name,
                    mime_type: Some("application/json".to_string()),
                    uri,
                }
            })
            .collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(resources)
    }

    async fn read(&self, uri: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.resources.get(uri).map(|v| v.value().clone()))
    }
}
