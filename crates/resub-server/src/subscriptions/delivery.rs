//! Per-connection notification delivery.
//!
//! Every connection gets one worker task with an ordered job queue, so
//! notifications to a connection leave in the order the dispatcher enqueued
//! them. Workers of different connections run concurrently, bounded by a
//! shared semaphore. Each job runs under the per-delivery timeout and any
//! failure (including a panic) is confined to that one job. A worker queue
//! holds at most `queue_capacity` jobs; a connection that cannot keep up
//! loses the overflow instead of growing memory.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use futures_util::FutureExt;
use resub_core::{ChangeType, ResourceChange, maybe_compress, project};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OnceCell, Semaphore, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::error::DeliveryError;
use super::pipeline::{TransformContext, TransformationPipeline, panic_message};
use super::provider::{Authorizer, ResourceProvider};
use super::registry::SubscriptionRegistry;
use super::types::{Action, DeliveryStage, ResourceUpdatedParams, Subscription};
use crate::config::{CompressionSettings, SubscriptionSettings};
use crate::metrics;
use crate::rpc::{RESOURCE_UPDATED_METHOD, RpcNotification};

/// Hands a notification to the client session identified by `connection_id`.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(
        &self,
        connection_id: &str,
        notification: RpcNotification,
    ) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub compression_level: u32,
}

impl DeliverySettings {
    pub fn from_config(subscriptions: &SubscriptionSettings, compression: &CompressionSettings) -> Self {
        Self {
            timeout: subscriptions.delivery_timeout(),
            max_concurrent: subscriptions.max_concurrent_deliveries,
            queue_capacity: subscriptions.max_queued_deliveries,
            compression_enabled: compression.enable_websocket_compression,
            compression_threshold: compression.compression_threshold,
            compression_level: compression.compression_level,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from_config(&SubscriptionSettings::default(), &CompressionSettings::default())
    }
}

/// Dispatch counters shared by the dispatcher and every worker.
#[derive(Debug, Default)]
pub struct DispatchStats {
    changes_received: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub changes_received: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
    pub notifications_skipped: u64,
}

impl DispatchStats {
    pub(crate) fn record_change(&self) {
        self.changes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            changes_received: self.changes_received.load(Ordering::Relaxed),
            notifications_delivered: self.delivered.load(Ordering::Relaxed),
            notifications_failed: self.failed.load(Ordering::Relaxed),
            notifications_skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// A change fanned out to several jobs. The provider is read at most once per change.
pub(crate) struct PendingChange {
    change: ResourceChange,
    payload: OnceCell<Option<Value>>,
}

impl PendingChange {
    pub(crate) fn new(change: ResourceChange) -> Self {
        Self {
            change,
            payload: OnceCell::new(),
        }
    }
}

pub(crate) struct DeliveryJob {
    pub(crate) subscription: Arc<Subscription>,
    pub(crate) change: Arc<PendingChange>,
}

struct StageTracker(AtomicU8);

impl StageTracker {
    fn new() -> Self {
        Self(AtomicU8::new(DeliveryStage::Idle as u8))
    }

    fn set(&self, stage: DeliveryStage) {
        tracing::trace!(stage = %stage, "Delivery stage");
        self.0.store(stage as u8, Ordering::Relaxed);
    }

    fn get(&self) -> DeliveryStage {
        DeliveryStage::from_u8(self.0.load(Ordering::Relaxed))
    }
}

enum Outcome {
    Delivered,
    Skipped(&'static str),
}

struct ConnectionWorker {
    sender: mpsc::Sender<DeliveryJob>,
    cancel: CancellationToken,
}

struct DeliveryShared {
    registry: Arc<SubscriptionRegistry>,
    pipeline: Arc<TransformationPipeline>,
    transport: Arc<dyn NotificationTransport>,
    provider: Option<Arc<dyn ResourceProvider>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    settings: DeliverySettings,
    permits: Semaphore,
    stats: Arc<DispatchStats>,
}

pub struct DeliveryManager {
    workers: DashMap<String, ConnectionWorker>,
    shared: Arc<DeliveryShared>,
}

impl DeliveryManager {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        pipeline: Arc<TransformationPipeline>,
        transport: Arc<dyn NotificationTransport>,
        provider: Option<Arc<dyn ResourceProvider>>,
        authorizer: Option<Arc<dyn Authorizer>>,
        settings: DeliverySettings,
    ) -> Self {
        let permits = Semaphore::new(settings.max_concurrent.max(1));
        Self {
            workers: DashMap::new(),
            shared: Arc::new(DeliveryShared {
                registry,
                pipeline,
                transport,
                provider,
                authorizer,
                settings,
                permits,
                stats: Arc::new(DispatchStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.shared.stats.clone()
    }

    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job on its connection's worker, starting the worker if needed.
    pub(crate) fn enqueue(&self, job: DeliveryJob) {
        if !self.shared.registry.contains(&job.subscription.id) {
            self.shared.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.push_to_worker(job);
    }

    fn push_to_worker(&self, job: DeliveryJob) {
        let connection_id = job.subscription.connection_id.clone();
        match self.sender_for(&connection_id).try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => self.drop_job(&job, "queue full"),
            Err(TrySendError::Closed(job)) => {
                // Worker exited without being removed; replace it once.
                self.workers.remove(&connection_id);
                if let Err(e) = self.sender_for(&connection_id).try_send(job) {
                    let job = match e {
                        TrySendError::Full(job) | TrySendError::Closed(job) => job,
                    };
                    self.drop_job(&job, "worker unavailable");
                }
            }
        }

        // The connection may have been cleaned up after the registry check but
        // before its worker was looked up; close_connection has already run then.
        if !self.shared.registry.has_connection(&connection_id) {
            self.close_connection(&connection_id);
        }
    }

    fn drop_job(&self, job: &DeliveryJob, reason: &'static str) {
        self.shared.stats.skipped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            subscription_id = %job.subscription.id,
            connection_id = %job.subscription.connection_id,
            uri = %job.change.change.uri,
            reason,
            "Notification dropped"
        );
        metrics::record_notification("skipped", Duration::ZERO);
    }

    /// Stop the worker of a closed connection. Queued and in-flight jobs are abandoned.
    pub fn close_connection(&self, connection_id: &str) -> bool {
        match self.workers.remove(connection_id) {
            Some((_, worker)) => {
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        for worker in self.workers.iter() {
            worker.cancel.cancel();
        }
        self.workers.clear();
    }

    fn sender_for(&self, connection_id: &str) -> mpsc::Sender<DeliveryJob> {
        self.workers
            .entry(connection_id.to_string())
            .or_insert_with(|| self.spawn_worker(connection_id))
            .sender
            .clone()
    }

    fn spawn_worker(&self, connection_id: &str) -> ConnectionWorker {
        let (sender, jobs) = mpsc::channel(self.shared.settings.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        tokio::spawn(run_worker(
            self.shared.clone(),
            connection_id.to_string(),
            jobs,
            cancel.clone(),
        ));
        tracing::trace!(connection_id = %connection_id, "Delivery worker started");
        ConnectionWorker { sender, cancel }
    }
}

impl Drop for DeliveryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    shared: Arc<DeliveryShared>,
    connection_id: String,
    mut jobs: mpsc::Receiver<DeliveryJob>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        shared.process(job, &cancel).await;
    }
    tracing::trace!(connection_id = %connection_id, "Delivery worker stopped");
}

impl DeliveryShared {
    async fn process(&self, job: DeliveryJob, cancel: &CancellationToken) {
        let started = Instant::now();
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        let stage = StageTracker::new();
        let attempt = timeout(
            self.settings.timeout,
            AssertUnwindSafe(self.deliver(&job, cancel, &stage)).catch_unwind(),
        );
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(Outcome::Skipped("connection closed")),
            result = attempt => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => Err(DeliveryError::Panicked(panic_message(panic.as_ref()))),
                Err(_) => Err(DeliveryError::Timeout(self.settings.timeout)),
            },
        };

        let subscription = &job.subscription;
        let uri = &job.change.change.uri;
        match outcome {
            Ok(Outcome::Delivered) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    subscription_id = %subscription.id,
                    connection_id = %subscription.connection_id,
                    uri = %uri,
                    "Notification delivered"
                );
                metrics::record_notification("delivered", started.elapsed());
            }
            Ok(Outcome::Skipped(reason)) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    subscription_id = %subscription.id,
                    connection_id = %subscription.connection_id,
                    uri = %uri,
                    reason,
                    "Notification skipped"
                );
                metrics::record_notification("skipped", started.elapsed());
            }
            Err(error) => {
                let failed_at = stage.get();
                stage.set(DeliveryStage::Failed);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    subscription_id = %subscription.id,
                    connection_id = %subscription.connection_id,
                    uri = %uri,
                    stage = %failed_at,
                    error = %error,
                    "Notification delivery failed"
                );
                metrics::record_notification("failed", started.elapsed());
            }
        }
    }

    async fn deliver(
        &self,
        job: &DeliveryJob,
        cancel: &CancellationToken,
        stage: &StageTracker,
    ) -> Result<Outcome, DeliveryError> {
        let subscription = &job.subscription;
        let change = &job.change.change;

        if cancel.is_cancelled() || !self.registry.contains(&subscription.id) {
            return Ok(Outcome::Skipped("unsubscribed"));
        }
        if let Some(authorizer) = &self.authorizer {
            if !authorizer
                .authorize(&subscription.user_context, &change.uri, Action::Read)
                .await
            {
                return Ok(Outcome::Skipped("unauthorized"));
            }
        }

        stage.set(DeliveryStage::Projecting);
        let data = match self.resolve_payload(&job.change).await? {
            Some(payload) => {
                let projected = match &subscription.fields {
                    Some(fields) => project(&payload, fields),
                    None => payload,
                };

                stage.set(DeliveryStage::Transforming);
                let ctx = TransformContext {
                    uri: change.uri.clone(),
                    change_type: change.change_type,
                    subscription: subscription.clone(),
                };
                Some(self.pipeline.apply(projected, &ctx).await?)
            }
            None => None,
        };

        stage.set(DeliveryStage::Compressing);
        let params = self.build_params(subscription, change, data)?;
        let notification =
            RpcNotification::new(RESOURCE_UPDATED_METHOD, serde_json::to_value(&params)?);

        stage.set(DeliveryStage::Delivering);
        if cancel.is_cancelled() || !self.registry.contains(&subscription.id) {
            return Ok(Outcome::Skipped("unsubscribed"));
        }
        self.transport
            .send(&subscription.connection_id, notification)
            .await?;
        subscription.mark_notified(OffsetDateTime::now_utc());
        stage.set(DeliveryStage::Idle);
        Ok(Outcome::Delivered)
    }

    async fn resolve_payload(&self, pending: &PendingChange) -> Result<Option<Value>, DeliveryError> {
        if let Some(payload) = &pending.change.payload {
            return Ok(Some(payload.clone()));
        }
        if pending.change.change_type == ChangeType::Deleted {
            return Ok(None);
        }
        let Some(provider) = &self.provider else {
            return Ok(None);
        };

        let payload = pending
            .payload
            .get_or_try_init(|| async {
                provider
                    .read(&pending.change.uri)
                    .await
                    .map_err(|e| DeliveryError::ResourceRead(format!("{e:#}")))
            })
            .await?;
        Ok(payload.clone())
    }

    fn build_params(
        &self,
        subscription: &Subscription,
        change: &ResourceChange,
        data: Option<Value>,
    ) -> Result<ResourceUpdatedParams, DeliveryError> {
        let mut params = ResourceUpdatedParams {
            uri: change.uri.clone(),
            change_type: change.change_type,
            timestamp: change.timestamp,
            subscription_id: subscription.id.clone(),
            data: None,
            compressed: false,
            compression_type: None,
            original_size: None,
            compressed_size: None,
        };
        let Some(data) = data else {
            return Ok(params);
        };
        if !self.settings.compression_enabled {
            params.data = Some(data);
            return Ok(params);
        }

        let serialized = serde_json::to_vec(&data)?;
        let outcome = maybe_compress(
            &serialized,
            self.settings.compression_threshold,
            self.settings.compression_level,
        )?;
        if outcome.was_compressed {
            params.compressed = true;
            params.compression_type = outcome.algorithm();
            params.original_size = Some(outcome.original_size);
            params.compressed_size = Some(outcome.bytes.len());
            params.data = Some(Value::String(STANDARD.encode(&outcome.bytes)));
        } else {
            params.data = Some(data);
        }
        Ok(params)
    }
}
