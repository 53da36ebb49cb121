//! Subscription registry.
//!
//! The one piece of mutable shared state in the engine. All mutations take
//! the write lock; `find_matching` takes the read lock, so a removal is either
//! fully visible to a concurrent match or not at all.
//!
//! Subscriptions are indexed twice:
//! - by the literal prefix of their pattern (text before the first `*`), so a
//!   lookup only runs full matching against patterns whose prefix is a prefix
//!   of the URI
//! - by owning connection, for cascading cleanup and the per-connection cap

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexSet;
use parking_lot::RwLock;
use resub_core::{UriPattern, generate_id, resolve_fields};
use time::OffsetDateTime;

use super::error::{SubscriptionError, SubscriptionResult};
use super::types::{
    BatchSubscribeReport, BatchUnsubscribeReport, Subscription, SubscriptionRequest, UserContext,
};
use crate::metrics;

/// Receives the ids of subscriptions after they are added or removed.
///
/// Called outside the registry lock. Implementations must not block.
pub trait RegistryObserver: Send + Sync {
    fn subscriptions_added(&self, ids: &[String]);
    fn subscriptions_removed(&self, ids: &[String]);
}

#[derive(Default)]
struct RegistryIndex {
    subscriptions: HashMap<String, Arc<Subscription>>,
    by_prefix: HashMap<String, HashSet<String>>,
    by_connection: HashMap<String, IndexSet<String>>,
}

impl RegistryIndex {
    fn insert(&mut self, subscription: Arc<Subscription>) {
        let id = subscription.id.clone();
        self.by_prefix
            .entry(subscription.pattern().literal_prefix().to_string())
            .or_default()
            .insert(id.clone());
        self.by_connection
            .entry(subscription.connection_id.clone())
            .or_default()
            .insert(id.clone());
        self.subscriptions.insert(id, subscription);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Subscription>> {
        let subscription = self.subscriptions.remove(id)?;

        let prefix = subscription.pattern().literal_prefix();
        if let Some(ids) = self.by_prefix.get_mut(prefix) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_prefix.remove(prefix);
            }
        }

        if let Some(ids) = self.by_connection.get_mut(&subscription.connection_id) {
            ids.shift_remove(id);
            if ids.is_empty() {
                self.by_connection.remove(&subscription.connection_id);
            }
        }

        Some(subscription)
    }

    fn connection_len(&self, connection_id: &str) -> usize {
        self.by_connection.get(connection_id).map_or(0, IndexSet::len)
    }
}

pub struct SubscriptionRegistry {
    index: RwLock<RegistryIndex>,
    max_per_connection: usize,
    observer: RwLock<Option<Arc<dyn RegistryObserver>>>,
}

impl SubscriptionRegistry {
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            index: RwLock::new(RegistryIndex::default()),
            max_per_connection,
            observer: RwLock::new(None),
        }
    }

    pub fn max_per_connection(&self) -> usize {
        self.max_per_connection
    }

    pub fn set_observer(&self, observer: Arc<dyn RegistryObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.observer.write() = None;
    }

    /// Validate and register one subscription, returning its id.
    pub fn create_subscription(
        &self,
        connection_id: &str,
        request: SubscriptionRequest,
        user_context: UserContext,
    ) -> SubscriptionResult<String> {
        let pattern = UriPattern::parse(&request.uri_pattern)
            .map_err(|e| SubscriptionError::invalid_pattern(&request.uri_pattern, e))?;
        let fields = resolve_fields(request.fields.as_deref(), request.fragments.as_ref())?;

        let subscription = Arc::new(Subscription::new(
            generate_id(),
            connection_id.to_string(),
            pattern,
            request.cursor,
            fields,
            user_context,
        ));
        let id = subscription.id.clone();

        let active = {
            let mut index = self.index.write();
            if index.connection_len(connection_id) >= self.max_per_connection {
                return Err(SubscriptionError::SubscriptionLimitExceeded {
                    connection_id: connection_id.to_string(),
                    limit: self.max_per_connection,
                });
            }
            index.insert(subscription.clone());
            index.subscriptions.len()
        };

        tracing::debug!(
            subscription_id = %id,
            connection_id = %connection_id,
            pattern = %subscription.uri_pattern,
            "Subscription created"
        );
        metrics::record_subscriptions_created(1);
        metrics::set_active_subscriptions(active);
        self.notify_added(std::slice::from_ref(&id));

        Ok(id)
    }

    /// Remove a subscription owned by `connection_id`.
    ///
    /// Returns `false` when the id is unknown or belongs to another connection.
    pub fn remove_subscription(&self, subscription_id: &str, connection_id: &str) -> bool {
        let (removed, active) = {
            let mut index = self.index.write();
            let owned = index
                .subscriptions
                .get(subscription_id)
                .is_some_and(|s| s.connection_id == connection_id);
            if !owned {
                return false;
            }
            (
                index.remove(subscription_id).is_some(),
                index.subscriptions.len(),
            )
        };

        if removed {
            tracing::debug!(
                subscription_id = %subscription_id,
                connection_id = %connection_id,
                "Subscription removed"
            );
            metrics::record_subscriptions_removed("unsubscribe", 1);
            metrics::set_active_subscriptions(active);
            self.notify_removed(&[subscription_id.to_string()]);
        }
        removed
    }

    /// Attempt every request independently, in input order.
    pub fn create_batch_subscriptions(
        &self,
        requests: Vec<SubscriptionRequest>,
        connection_id: &str,
        user_context: &UserContext,
    ) -> BatchSubscribeReport {
        let mut report = BatchSubscribeReport::default();
        for (i, request) in requests.into_iter().enumerate() {
            let name = request.display_name(i);
            let outcome = self.create_subscription(connection_id, request, user_context.clone());
            if let Err(e) = &outcome {
                tracing::debug!(name = %name, error = %e, "Batch subscription item failed");
            }
            report.push(name, outcome);
        }
        report
    }

    pub fn remove_batch_subscriptions(
        &self,
        subscription_ids: &[String],
        connection_id: &str,
    ) -> BatchUnsubscribeReport {
        let mut report = BatchUnsubscribeReport::default();
        for id in subscription_ids {
            if self.remove_subscription(id, connection_id) {
                report.removed.push(id.clone());
            } else {
                report.not_found.push(id.clone());
            }
        }
        report
    }

    /// Remove every subscription owned by a connection. Returns the count removed.
    pub fn cleanup_connection(&self, connection_id: &str) -> usize {
        let (removed, active) = {
            let mut index = self.index.write();
            let ids: Vec<String> = index
                .by_connection
                .get(connection_id)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();
            for id in &ids {
                index.remove(id);
            }
            (ids, index.subscriptions.len())
        };

        if !removed.is_empty() {
            tracing::debug!(
                connection_id = %connection_id,
                removed = removed.len(),
                "Connection subscriptions cleaned up"
            );
            metrics::record_subscriptions_removed("disconnect", removed.len());
            metrics::set_active_subscriptions(active);
            self.notify_removed(&removed);
        }
        removed.len()
    }

    /// Subscriptions whose pattern matches `uri`.
    pub fn find_matching(&self, uri: &str) -> Vec<Arc<Subscription>> {
        let index = self.index.read();
        let mut matches = Vec::new();

        let boundaries = uri
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(uri.len()));
        for end in boundaries {
            let Some(ids) = index.by_prefix.get(&uri[..end]) else {
                continue;
            };
            matches.extend(
                ids.iter()
                    .filter_map(|id| index.subscriptions.get(id))
                    .filter(|s| s.matches(uri))
                    .cloned(),
            );
        }
        matches
    }

    /// Remove subscriptions idle for longer than `ttl`.
    pub fn cleanup_expired(&self, ttl: Duration) -> usize {
        let now = OffsetDateTime::now_utc();
        let (removed, active) = {
            let mut index = self.index.write();
            let expired: Vec<String> = index
                .subscriptions
                .values()
                .filter(|s| s.is_expired(ttl, now))
                .map(|s| s.id.clone())
                .collect();
            for id in &expired {
                index.remove(id);
            }
            (expired, index.subscriptions.len())
        };

        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "Expired subscriptions removed");
            metrics::record_subscriptions_removed("expired", removed.len());
            metrics::set_active_subscriptions(active);
            self.notify_removed(&removed);
        }
        removed.len()
    }

    pub fn get(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        self.index.read().subscriptions.get(subscription_id).cloned()
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.index.read().subscriptions.contains_key(subscription_id)
    }

    /// True while `connection_id` owns at least one subscription.
    pub fn has_connection(&self, connection_id: &str) -> bool {
        self.index.read().by_connection.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.index.read().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connection_count(&self) -> usize {
        self.index.read().by_connection.len()
    }

    /// Subscriptions of one connection in creation order.
    pub fn connection_subscriptions(&self, connection_id: &str) -> Vec<Arc<Subscription>> {
        let index = self.index.read();
        index
            .by_connection
            .get(connection_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.subscriptions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        self.index.read().subscriptions.keys().cloned().collect()
    }

    fn notify_added(&self, ids: &[String]) {
        if let Some(observer) = self.observer.read().clone() {
            observer.subscriptions_added(ids);
        }
    }

    fn notify_removed(&self, ids: &[String]) {
        if let Some(observer) = self.observer.read().clone() {
            observer.subscriptions_removed(ids);
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .field("max_per_connection", &self.max_per_connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use resub_core::Fragments;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(10)
    }

    fn subscribe(registry: &SubscriptionRegistry, conn: &str, pattern: &str) -> String {
        registry
            .create_subscription(conn, SubscriptionRequest::new(pattern), UserContext::new())
            .unwrap()
    }

    #[test]
    fn create_then_remove_restores_count() {
        let registry = registry();
        subscribe(&registry, "c1", "file:///other/**");
        let before = registry.len();

        let id = subscribe(&registry, "c1", "file:///*.json");
        assert_eq!(registry.len(), before + 1);
        assert!(registry.remove_subscription(&id, "c1"));
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn remove_rejects_foreign_connection() {
        let registry = registry();
        let id = subscribe(&registry, "c1", "file:///a.json");

        assert!(!registry.remove_subscription(&id, "c2"));
        assert!(registry.contains(&id));
        assert!(!registry.remove_subscription("missing", "c1"));
    }

    #[test]
    fn invalid_pattern_is_rejected_at_creation() {
        let registry = registry();
        let err = registry
            .create_subscription("c1", SubscriptionRequest::new("file:///***"), UserContext::new())
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidPattern { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn per_connection_cap_is_enforced() {
        let registry = SubscriptionRegistry::new(2);
        subscribe(&registry, "c1", "file:///a");
        subscribe(&registry, "c1", "file:///b");

        let err = registry
            .create_subscription("c1", SubscriptionRequest::new("file:///c"), UserContext::new())
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::SubscriptionLimitExceeded { limit: 2, .. }));

        // Other connections have their own budget
        subscribe(&registry, "c2", "file:///c");
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn fragments_are_resolved_once_at_creation() {
        let registry = registry();
        let mut fragments = Fragments::new();
        fragments.insert("basic".into(), vec!["id".into(), "name".into()]);

        let request = SubscriptionRequest::new("file:///**")
            .with_fields(["...basic", "size", "id"])
            .with_fragments(fragments);
        let id = registry
            .create_subscription("c1", request, UserContext::new())
            .unwrap();

        let sub = registry.get(&id).unwrap();
        assert_eq!(
            sub.fields.as_deref(),
            Some(&["id".to_string(), "name".to_string(), "size".to_string()][..])
        );
    }

    #[test]
    fn find_matching_uses_prefix_index_and_full_match() {
        let registry = registry();
        let json = subscribe(&registry, "c1", "file:///*.json");
        let deep = subscribe(&registry, "c2", "file:///**");
        let everything = subscribe(&registry, "c3", "**");
        let other = subscribe(&registry, "c1", "http://host/*");

        let mut ids: Vec<String> = registry
            .find_matching("file:///a.json")
            .iter()
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        let mut expected = vec![json.clone(), deep.clone(), everything.clone()];
        expected.sort();
        assert_eq!(ids, expected);

        let nested: Vec<String> = registry
            .find_matching("file:///a/b.json")
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert!(!nested.contains(&json));
        assert!(nested.contains(&deep));
        assert!(!nested.contains(&other));
    }

    #[test]
    fn double_star_subscription_matches_its_own_root() {
        let registry = registry();
        let docs = subscribe(&registry, "c1", "file:///docs/**");
        subscribe(&registry, "c2", "file:///docs/*");

        let ids: Vec<String> = registry
            .find_matching("file:///docs")
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(ids, vec![docs.clone()]);

        assert_eq!(registry.find_matching("file:///docs/a/b.md").len(), 1);
        assert!(registry.find_matching("file:///doc").is_empty());
    }

    #[test]
    fn cursor_is_kept_on_the_subscription() {
        let registry = registry();
        let request =
            SubscriptionRequest::new("file:///logs/*").with_cursor("ZmlsZTovLy9sb2dzL2E");
        let id = registry
            .create_subscription("c1", request, UserContext::new())
            .unwrap();

        let sub = registry.get(&id).unwrap();
        assert_eq!(sub.cursor.as_deref(), Some("ZmlsZTovLy9sb2dzL2E"));
        // Listing state never affects matching
        assert!(sub.matches("file:///logs/b"));
    }

    #[test]
    fn cleanup_connection_is_idempotent() {
        let registry = registry();
        subscribe(&registry, "c1", "file:///a");
        subscribe(&registry, "c1", "file:///b");
        subscribe(&registry, "c2", "file:///a");

        assert_eq!(registry.cleanup_connection("c1"), 2);
        assert_eq!(registry.cleanup_connection("c1"), 0);
        assert_eq!(registry.len(), 1);
        assert!(registry.find_matching("file:///b").is_empty());
    }

    #[test]
    fn batch_reports_partial_failure_in_order() {
        let registry = registry();
        let requests = vec![
            SubscriptionRequest::new("file:///a").with_name("first"),
            SubscriptionRequest::new("file:///{broken").with_name("second"),
            SubscriptionRequest::new("file:///c").with_name("third"),
        ];

        let report = registry.create_batch_subscriptions(requests, "c1", &UserContext::new());
        assert_eq!(report.total_requested, 3);
        assert_eq!(report.total_created, 2);
        assert_eq!(report.total_failed, 1);
        assert_eq!(report.results[1].name, "second");
        assert!(report.results[1].error.is_some());
    }

    #[test]
    fn batch_remove_splits_removed_and_not_found() {
        let registry = registry();
        let mine = subscribe(&registry, "c1", "file:///a");
        let theirs = subscribe(&registry, "c2", "file:///a");

        let report = registry
            .remove_batch_subscriptions(&[mine.clone(), theirs.clone(), "nope".into()], "c1");
        assert_eq!(report.removed, vec![mine]);
        assert_eq!(report.not_found, vec![theirs, "nope".to_string()]);
    }

    #[test]
    fn cleanup_expired_uses_last_activity() {
        let registry = registry();
        let stale = subscribe(&registry, "c1", "file:///a");
        let fresh = subscribe(&registry, "c1", "file:///b");

        registry
            .get(&fresh)
            .unwrap()
            .mark_notified(OffsetDateTime::now_utc() + Duration::from_secs(120));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.cleanup_expired(Duration::ZERO), 1);
        assert!(!registry.contains(&stale));
        assert!(registry.contains(&fresh));
    }

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl RegistryObserver for Recorder {
        fn subscriptions_added(&self, ids: &[String]) {
            self.added.lock().extend_from_slice(ids);
        }
        fn subscriptions_removed(&self, ids: &[String]) {
            self.removed.lock().extend_from_slice(ids);
        }
    }

    #[test]
    fn observer_sees_every_mutation() {
        let registry = registry();
        let recorder = Arc::new(Recorder::default());
        registry.set_observer(recorder.clone());

        let a = subscribe(&registry, "c1", "file:///a");
        let b = subscribe(&registry, "c1", "file:///b");
        registry.remove_subscription(&a, "c1");
        registry.cleanup_connection("c1");

        assert_eq!(*recorder.added.lock(), vec![a.clone(), b.clone()]);
        assert_eq!(*recorder.removed.lock(), vec![a, b]);
    }
}
