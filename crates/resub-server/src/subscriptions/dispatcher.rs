//! Notification dispatcher.
//!
//! Consumes resource changes from the broadcaster, finds matching
//! subscriptions and hands one delivery job per match to the delivery
//! manager. Matching never waits on delivery.

use std::sync::Arc;

use resub_core::ResourceChange;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::delivery::{DeliveryJob, DeliveryManager, DispatchStats, PendingChange};
use super::registry::SubscriptionRegistry;
use crate::metrics;

pub struct NotificationDispatcher {
    registry: Arc<SubscriptionRegistry>,
    delivery: Arc<DeliveryManager>,
    stats: Arc<DispatchStats>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, delivery: Arc<DeliveryManager>) -> Self {
        let stats = delivery.stats();
        Self {
            registry,
            delivery,
            stats,
        }
    }

    /// Fan a change out to every matching subscription. Returns the match count.
    pub fn dispatch(&self, change: ResourceChange) -> usize {
        if !change.is_concrete() {
            warn!(uri = %change.uri, "Ignoring change with a non-concrete URI");
            return 0;
        }
        self.stats.record_change();
        metrics::record_change(change.change_type.as_str());

        let matches = self.registry.find_matching(&change.uri);
        if matches.is_empty() {
            tracing::trace!(uri = %change.uri, "No matching subscriptions");
            return 0;
        }

        tracing::debug!(
            uri = %change.uri,
            change_type = %change.change_type,
            matches = matches.len(),
            "Dispatching change"
        );
        let count = matches.len();
        let pending = Arc::new(PendingChange::new(change));
        for subscription in matches {
            self.delivery.enqueue(DeliveryJob {
                subscription,
                change: pending.clone(),
            });
        }
        count
    }

    /// Run until the channel closes or `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: broadcast::Receiver<ResourceChange>,
        shutdown: CancellationToken,
    ) {
        info!("Starting notification dispatcher");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = receiver.recv() => received,
            };
            match received {
                Ok(change) => {
                    self.dispatch(change);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Dispatcher lagged, missed changes");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Change channel closed, stopping dispatcher");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("registry", &self.registry)
            .field("workers", &self.delivery.active_workers())
            .finish()
    }
}
