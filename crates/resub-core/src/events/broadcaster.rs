//! In-process change bus.
//!
//! The `ChangeBroadcaster` fans resource changes out to every interested
//! consumer using tokio's broadcast channel.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::ResourceChange;

/// Default buffer size for the broadcast channel.
/// Slow receivers lose the oldest changes beyond this limit.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Cloneable broadcaster for resource changes.
///
/// # Example
///
/// ```
/// use resub_core::events::{ChangeBroadcaster, ResourceChange};
///
/// let broadcaster = ChangeBroadcaster::new();
/// let mut receiver = broadcaster.subscribe();
///
/// broadcaster.send(ResourceChange::created("file:///a.json", serde_json::json!({})));
///
/// // let change = receiver.recv().await.unwrap();
/// ```
#[derive(Clone)]
pub struct ChangeBroadcaster {
    sender: broadcast::Sender<ResourceChange>,
}

impl ChangeBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Send a change to all subscribers.
    ///
    /// Returns the number of receivers that got the change, 0 when nobody listens.
    pub fn send(&self, change: ResourceChange) -> usize {
        self.sender.send(change).unwrap_or_default()
    }

    /// Receive every change sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceChange> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBroadcaster")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
