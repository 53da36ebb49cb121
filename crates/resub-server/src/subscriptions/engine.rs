//! The subscription engine.
//!
//! Owns the registry, pipeline, dispatcher and delivery workers. One engine
//! is created per server process and shared with request handlers by `Arc`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use resub_core::{ChangeBroadcaster, ResourceChange};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::delivery::{DeliveryManager, DeliverySettings, DispatchStatsSnapshot, NotificationTransport};
use super::dispatcher::NotificationDispatcher;
use super::error::{SubscriptionError, SubscriptionResult};
use super::listing::{ResourcePage, paginate};
use super::pipeline::TransformationPipeline;
use super::provider::{Authorizer, ResourceProvider};
use super::registry::SubscriptionRegistry;
use super::types::{
    Action, BatchSubscribeReport, BatchUnsubscribeReport, SubscriptionRequest, UserContext,
};
use crate::config::{CompressionSettings, SubscriptionSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub active_subscriptions: usize,
    pub connections: usize,
    pub delivery_workers: usize,
    pub dispatch: DispatchStatsSnapshot,
}

pub struct SubscriptionEngineBuilder {
    transport: Arc<dyn NotificationTransport>,
    settings: SubscriptionSettings,
    compression: CompressionSettings,
    provider: Option<Arc<dyn ResourceProvider>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    pipeline: Option<Arc<TransformationPipeline>>,
    broadcaster: Option<ChangeBroadcaster>,
}

impl SubscriptionEngineBuilder {
    pub fn settings(mut self, settings: SubscriptionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn compression(mut self, compression: CompressionSettings) -> Self {
        self.compression = compression;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<TransformationPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn broadcaster(mut self, broadcaster: ChangeBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn build(self) -> Arc<SubscriptionEngine> {
        let registry = Arc::new(SubscriptionRegistry::new(
            self.settings.max_subscriptions_per_connection,
        ));
        let pipeline = self.pipeline.unwrap_or_default();
        let delivery = Arc::new(DeliveryManager::new(
            registry.clone(),
            pipeline.clone(),
            self.transport,
            self.provider.clone(),
            self.authorizer.clone(),
            DeliverySettings::from_config(&self.settings, &self.compression),
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            registry.clone(),
            delivery.clone(),
        ));

        Arc::new(SubscriptionEngine {
            settings: self.settings,
            registry,
            pipeline,
            delivery,
            dispatcher,
            broadcaster: self.broadcaster.unwrap_or_default(),
            provider: self.provider,
            authorizer: self.authorizer,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

pub struct SubscriptionEngine {
    settings: SubscriptionSettings,
    registry: Arc<SubscriptionRegistry>,
    pipeline: Arc<TransformationPipeline>,
    delivery: Arc<DeliveryManager>,
    dispatcher: Arc<NotificationDispatcher>,
    broadcaster: ChangeBroadcaster,
    provider: Option<Arc<dyn ResourceProvider>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionEngine {
    pub fn builder(transport: Arc<dyn NotificationTransport>) -> SubscriptionEngineBuilder {
        SubscriptionEngineBuilder {
            transport,
            settings: SubscriptionSettings::default(),
            compression: CompressionSettings::default(),
            provider: None,
            authorizer: None,
            pipeline: None,
            broadcaster: None,
        }
    }

    /// Spawn the dispatch loop and the expiry sweeper. Calling twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let receiver = self.broadcaster.subscribe();
        tasks.push(tokio::spawn(
            self.dispatcher
                .clone()
                .run(receiver, self.shutdown.child_token()),
        ));
        tasks.push(tokio::spawn(run_expiry_sweeper(
            self.registry.clone(),
            self.settings.subscription_ttl(),
            self.settings.cleanup_interval(),
            self.shutdown.child_token(),
        )));

        info!(
            max_per_connection = self.settings.max_subscriptions_per_connection,
            ttl_secs = self.settings.subscription_ttl_secs,
            "Subscription engine started"
        );
    }

    /// Stop background tasks and delivery workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Engine task ended abnormally");
            }
        }
        self.delivery.shutdown();
        info!("Subscription engine stopped");
    }

    pub async fn subscribe(
        &self,
        connection_id: &str,
        request: SubscriptionRequest,
        user_context: UserContext,
    ) -> SubscriptionResult<String> {
        self.ensure_enabled()?;
        self.authorize_subscribe(&user_context, &request.uri_pattern)
            .await?;
        self.registry
            .create_subscription(connection_id, request, user_context)
    }

    pub fn unsubscribe(&self, subscription_id: &str, connection_id: &str) -> SubscriptionResult<()> {
        if self.registry.remove_subscription(subscription_id, connection_id) {
            Ok(())
        } else {
            Err(SubscriptionError::SubscriptionNotFound(
                subscription_id.to_string(),
            ))
        }
    }

    /// Create several subscriptions. Items fail independently.
    pub async fn batch_subscribe(
        &self,
        connection_id: &str,
        requests: Vec<SubscriptionRequest>,
        user_context: UserContext,
    ) -> SubscriptionResult<BatchSubscribeReport> {
        self.ensure_enabled()?;
        if self.authorizer.is_none() {
            return Ok(self
                .registry
                .create_batch_subscriptions(requests, connection_id, &user_context));
        }

        let mut report = BatchSubscribeReport::default();
        for (i, request) in requests.into_iter().enumerate() {
            let name = request.display_name(i);
            let outcome = match self.authorize_subscribe(&user_context, &request.uri_pattern).await {
                Ok(()) => self
                    .registry
                    .create_subscription(connection_id, request, user_context.clone()),
                Err(e) => Err(e),
            };
            report.push(name, outcome);
        }
        Ok(report)
    }

    pub fn batch_unsubscribe(
        &self,
        connection_id: &str,
        subscription_ids: &[String],
    ) -> BatchUnsubscribeReport {
        self.registry
            .remove_batch_subscriptions(subscription_ids, connection_id)
    }

    /// Drop everything owned by a closed connection and stop its delivery worker.
    pub fn cleanup_connection(&self, connection_id: &str) -> usize {
        let removed = self.registry.cleanup_connection(connection_id);
        self.delivery.close_connection(connection_id);
        removed
    }

    /// Publish a change to the dispatcher (and any other broadcaster listener).
    pub fn publish_change(&self, change: ResourceChange) -> usize {
        self.broadcaster.send(change)
    }

    pub fn cleanup_expired(&self) -> usize {
        self.registry
            .cleanup_expired(self.settings.subscription_ttl())
    }

    pub async fn list_resources(
        &self,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> SubscriptionResult<ResourcePage> {
        let limit = limit
            .unwrap_or(self.settings.list_page_size)
            .clamp(1, self.settings.max_list_page_size);
        let resources = match &self.provider {
            Some(provider) => provider
                .list()
                .await
                .map_err(|e| SubscriptionError::Provider(format!("{e:#}")))?,
            None => Vec::new(),
        };
        paginate(resources, limit, cursor)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_subscriptions: self.registry.len(),
            connections: self.registry.connection_count(),
            delivery_workers: self.delivery.active_workers(),
            dispatch: self.dispatcher.stats().snapshot(),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<TransformationPipeline> {
        &self.pipeline
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn broadcaster(&self) -> &ChangeBroadcaster {
        &self.broadcaster
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    fn ensure_enabled(&self) -> SubscriptionResult<()> {
        if self.settings.enable_subscriptions {
            Ok(())
        } else {
            Err(SubscriptionError::SubscriptionsDisabled)
        }
    }

    async fn authorize_subscribe(
        &self,
        user_context: &UserContext,
        uri_pattern: &str,
    ) -> SubscriptionResult<()> {
        let Some(authorizer) = &self.authorizer else {
            return Ok(());
        };
        if authorizer
            .authorize(user_context, uri_pattern, Action::Subscribe)
            .await
        {
            Ok(())
        } else {
            Err(SubscriptionError::Unauthorized(uri_pattern.to_string()))
        }
    }
}

impl std::fmt::Debug for SubscriptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEngine")
            .field("registry", &self.registry)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

async fn run_expiry_sweeper(
    registry: Arc<SubscriptionRegistry>,
    ttl: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = registry.cleanup_expired(ttl);
                tracing::trace!(removed, "Expiry sweep finished");
            }
        }
    }
}
