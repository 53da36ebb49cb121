//! Distributed coordinator.
//!
//! Lets several server instances share one resource space. Matching always
//! stays local: each instance only holds subscriptions of its own connections.
//! The coordinator moves changes between instances and keeps an
//! observability view of who is alive and how many subscriptions they hold.
//!
//! Background tasks:
//! - heartbeat: writes this instance's record, purges instances that stopped
//!   heartbeating and resyncs mirrored ids after an outage
//! - forwarder: publishes locally originated changes to the shared channel
//! - listener: feeds remote changes into the local broadcaster, reconnecting
//!   with exponential backoff
//! - mirror: copies registry additions/removals into the shared store
//!
//! Store failures never stop local delivery. They flip the coordinator into
//! a degraded state that clears on the next successful heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use resub_core::{ChangeBroadcaster, ResourceChange, generate_id};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{SharedStore, StoreError};
use super::{CHANGES_CHANNEL, INSTANCES_KEY, instance_key, subscriptions_key};
use crate::config::DistributedConfig;
use crate::subscriptions::{RegistryObserver, SubscriptionRegistry};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Delay before the next listener reconnect. Doubles per failure up to `max`
/// and starts over once a subscription is established.
#[derive(Debug)]
struct ReconnectBackoff {
    next: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    fn new(max: Duration) -> Self {
        Self {
            next: INITIAL_BACKOFF.min(max),
            max,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = INITIAL_BACKOFF.min(self.max);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("Distributed coordination degraded: {0}")]
    Degraded(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub instance_id: String,
    pub heartbeat_interval: Duration,
    pub instance_timeout: Duration,
    pub max_reconnect_backoff: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &DistributedConfig) -> Self {
        Self {
            instance_id: config
                .server_instance_id
                .clone()
                .unwrap_or_else(generate_id),
            heartbeat_interval: config.heartbeat_interval(),
            instance_timeout: config.instance_timeout(),
            max_reconnect_backoff: config.max_reconnect_backoff(),
        }
    }
}

/// Liveness record written by every instance on each heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
    pub subscription_count: usize,
}

impl InstanceRecord {
    fn is_alive(&self, now: OffsetDateTime, timeout: Duration) -> bool {
        now - self.last_heartbeat <= timeout
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteInstance {
    pub instance_id: String,
    pub subscription_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributedStats {
    pub instance_id: String,
    pub degraded: bool,
    pub local_subscriptions: usize,
    pub total_subscriptions: usize,
    pub other_instances: Vec<RemoteInstance>,
}

enum MirrorOp {
    Add(Vec<String>),
    Remove(Vec<String>),
}

struct MirrorObserver {
    ops: mpsc::UnboundedSender<MirrorOp>,
}

impl RegistryObserver for MirrorObserver {
    fn subscriptions_added(&self, ids: &[String]) {
        let _ = self.ops.send(MirrorOp::Add(ids.to_vec()));
    }

    fn subscriptions_removed(&self, ids: &[String]) {
        let _ = self.ops.send(MirrorOp::Remove(ids.to_vec()));
    }
}

pub struct DistributedCoordinator {
    settings: CoordinatorSettings,
    store: Arc<dyn SharedStore>,
    registry: Arc<SubscriptionRegistry>,
    broadcaster: ChangeBroadcaster,
    degraded: AtomicBool,
    resync_needed: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributedCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        store: Arc<dyn SharedStore>,
        registry: Arc<SubscriptionRegistry>,
        broadcaster: ChangeBroadcaster,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            registry,
            broadcaster,
            degraded: AtomicBool::new(false),
            resync_needed: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.settings.instance_id
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Hook into the registry and spawn the background tasks.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        self.registry
            .set_observer(Arc::new(MirrorObserver { ops: ops_tx }));

        // Subscribe before spawning so no local change is missed
        let local_changes = self.broadcaster.subscribe();

        tasks.push(tokio::spawn(self.clone().run_heartbeat()));
        tasks.push(tokio::spawn(self.clone().run_forwarder(local_changes)));
        tasks.push(tokio::spawn(self.clone().run_listener()));
        tasks.push(tokio::spawn(self.clone().run_mirror(ops_rx)));

        info!(
            instance_id = %self.settings.instance_id,
            heartbeat_secs = self.settings.heartbeat_interval.as_secs(),
            "Distributed coordinator started"
        );
    }

    /// Stop background tasks and remove this instance from the shared store.
    pub async fn shutdown(&self) {
        self.registry.clear_observer();
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Coordinator task ended abnormally");
            }
        }

        if let Err(e) = self.purge_instance(&self.settings.instance_id).await {
            warn!(error = %e, "Failed to remove instance record on shutdown");
        }
        info!(instance_id = %self.settings.instance_id, "Distributed coordinator stopped");
    }

    /// Write this instance's record, purge dead instances and resync if needed.
    pub async fn heartbeat(&self) -> Result<(), CoordinationError> {
        match self.heartbeat_once().await {
            Ok(()) => {
                self.mark_recovered();
                Ok(())
            }
            Err(e) => {
                let error = CoordinationError::from(e);
                self.mark_degraded(&error);
                Err(error)
            }
        }
    }

    async fn heartbeat_once(&self) -> Result<(), StoreError> {
        let id = &self.settings.instance_id;
        let now = OffsetDateTime::now_utc();
        let record = InstanceRecord {
            instance_id: id.clone(),
            last_heartbeat: now,
            subscription_count: self.registry.len(),
        };

        self.store
            .set(
                &instance_key(id),
                &serde_json::to_string(&record)?,
                Some(self.settings.instance_timeout * 2),
            )
            .await?;
        self.store
            .set_add(INSTANCES_KEY, std::slice::from_ref(id))
            .await?;

        if self.resync_needed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.resync_subscriptions().await {
                self.resync_needed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }

        self.purge_dead_instances(now).await
    }

    /// Replace the mirrored id set with the registry's current contents.
    async fn resync_subscriptions(&self) -> Result<(), StoreError> {
        let key = subscriptions_key(&self.settings.instance_id);
        let ids = self.registry.subscription_ids();
        self.store.delete(&key).await?;
        self.store.set_add(&key, &ids).await?;
        debug!(mirrored = ids.len(), "Subscription ids resynced");
        Ok(())
    }

    async fn purge_dead_instances(&self, now: OffsetDateTime) -> Result<(), StoreError> {
        for other in self.store.set_members(INSTANCES_KEY).await? {
            if other == self.settings.instance_id {
                continue;
            }
            let alive = self
                .read_record(&other)
                .await?
                .is_some_and(|r| r.is_alive(now, self.settings.instance_timeout));
            if !alive {
                self.purge_instance(&other).await?;
                info!(instance_id = %other, "Purged dead instance");
            }
        }
        Ok(())
    }

    /// Delete-if-exists, so racing purges from several instances are harmless.
    async fn purge_instance(&self, instance_id: &str) -> Result<(), StoreError> {
        self.store.delete(&subscriptions_key(instance_id)).await?;
        self.store.delete(&instance_key(instance_id)).await?;
        self.store
            .set_remove(INSTANCES_KEY, &[instance_id.to_string()])
            .await
    }

    async fn read_record(&self, instance_id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        let Some(raw) = self.store.get(&instance_key(instance_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Ignoring malformed instance record");
                Ok(None)
            }
        }
    }

    /// Cluster view. Instances past the timeout are left out.
    pub async fn get_distributed_stats(&self) -> DistributedStats {
        let local = self.registry.len();
        let mut stats = DistributedStats {
            instance_id: self.settings.instance_id.clone(),
            degraded: self.is_degraded(),
            local_subscriptions: local,
            total_subscriptions: local,
            other_instances: Vec::new(),
        };

        match self.remote_instances().await {
            Ok(others) => {
                stats.total_subscriptions += others.iter().map(|i| i.subscription_count).sum::<usize>();
                stats.other_instances = others;
            }
            Err(e) => {
                debug!(error = %e, "Distributed stats unavailable");
                stats.degraded = true;
            }
        }
        stats
    }

    async fn remote_instances(&self) -> Result<Vec<RemoteInstance>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut others = Vec::new();
        for id in self.store.set_members(INSTANCES_KEY).await? {
            if id == self.settings.instance_id {
                continue;
            }
            if let Some(record) = self.read_record(&id).await? {
                if record.is_alive(now, self.settings.instance_timeout) {
                    others.push(RemoteInstance {
                        instance_id: record.instance_id,
                        subscription_count: record.subscription_count,
                        last_heartbeat: record.last_heartbeat,
                    });
                }
            }
        }
        others.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(others)
    }

    fn mark_degraded(&self, error: &CoordinationError) {
        self.resync_needed.store(true, Ordering::SeqCst);
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                instance_id = %self.settings.instance_id,
                error = %error,
                "Falling back to local-only delivery"
            );
        }
    }

    fn mark_recovered(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!(instance_id = %self.settings.instance_id, "Distributed coordination recovered");
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.heartbeat().await;
                }
            }
        }
    }

    async fn run_forwarder(self: Arc<Self>, mut changes: broadcast::Receiver<ResourceChange>) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = changes.recv() => received,
            };
            match received {
                // Changes that already carry an origin came from the shared channel
                Ok(change) if change.origin.is_none() => self.forward(change).await,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Forwarder lagged, changes not shared with other instances");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn forward(&self, change: ResourceChange) {
        let change = change.with_origin(self.settings.instance_id.clone());
        let message = match serde_json::to_string(&change) {
            Ok(message) => message,
            Err(e) => {
                warn!(uri = %change.uri, error = %e, "Failed to serialize change");
                return;
            }
        };
        if let Err(e) = self.store.publish(CHANGES_CHANNEL, &message).await {
            self.mark_degraded(&CoordinationError::from(e));
        } else {
            debug!(uri = %change.uri, "Published change to other instances");
        }
    }

    async fn run_listener(self: Arc<Self>) {
        let mut backoff = ReconnectBackoff::new(self.settings.max_reconnect_backoff);
        while !self.shutdown.is_cancelled() {
            match self.listen(&mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    self.mark_degraded(&CoordinationError::from(e));
                    let delay = backoff.next_delay();
                    debug!(retry_in_secs = delay.as_secs(), "Change listener reconnecting");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Returns `Ok` only on shutdown.
    async fn listen(&self, backoff: &mut ReconnectBackoff) -> Result<(), StoreError> {
        let mut messages = self.store.subscribe(CHANGES_CHANNEL).await?;
        backoff.reset();
        info!(channel = CHANGES_CHANNEL, "Subscribed to shared change channel");

        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                message = messages.next() => message,
            };
            let Some(message) = message else {
                return Err(StoreError::StreamEnded);
            };

            match serde_json::from_str::<ResourceChange>(&message) {
                Ok(change) if change.origin.as_deref() == Some(self.settings.instance_id.as_str()) => {}
                Ok(change) => {
                    debug!(uri = %change.uri, origin = ?change.origin, "Received change from another instance");
                    self.broadcaster.send(change);
                }
                Err(e) => warn!(error = %e, "Failed to deserialize shared change"),
            }
        }
    }

    async fn run_mirror(self: Arc<Self>, mut ops: mpsc::UnboundedReceiver<MirrorOp>) {
        let key = subscriptions_key(&self.settings.instance_id);
        loop {
            let op = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                op = ops.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };
            let result = match &op {
                MirrorOp::Add(ids) => self.store.set_add(&key, ids).await,
                MirrorOp::Remove(ids) => self.store.set_remove(&key, ids).await,
            };
            if let Err(e) = result {
                self.mark_degraded(&CoordinationError::from(e));
            }
        }
    }
}

impl std::fmt::Debug for DistributedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCoordinator")
            .field("instance_id", &self.settings.instance_id)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
