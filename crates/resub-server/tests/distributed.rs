//! Multi-instance behavior over the in-memory shared store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use resub_core::ResourceChange;
use resub_server::distributed::{
    CoordinatorSettings, DistributedCoordinator, INSTANCES_KEY, InstanceRecord, MemoryStore,
    SharedStore, instance_key, subscriptions_key,
};
use resub_server::rpc::RpcNotification;
use resub_server::subscriptions::{
    DeliveryError, NotificationTransport, SubscriptionEngine, SubscriptionRequest, UserContext,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::mpsc;

struct ChannelTransport {
    tx: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl NotificationTransport for ChannelTransport {
    async fn send(&self, _: &str, notification: RpcNotification) -> Result<(), DeliveryError> {
        self.tx
            .send(notification.params)
            .map_err(|e| DeliveryError::Transport(e.to_string()))
    }
}

struct Instance {
    engine: Arc<SubscriptionEngine>,
    coordinator: Arc<DistributedCoordinator>,
    inbox: mpsc::UnboundedReceiver<Value>,
}

impl Instance {
    fn start(id: &str, store: Arc<MemoryStore>) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let engine = SubscriptionEngine::builder(Arc::new(ChannelTransport { tx })).build();
        engine.start();

        let coordinator = DistributedCoordinator::new(
            CoordinatorSettings {
                instance_id: id.to_string(),
                heartbeat_interval: Duration::from_secs(3600),
                instance_timeout: Duration::from_secs(30),
                max_reconnect_backoff: Duration::from_secs(1),
            },
            store,
            engine.registry().clone(),
            engine.broadcaster().clone(),
        );
        coordinator.start();

        Self {
            engine,
            coordinator,
            inbox,
        }
    }

    async fn next(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.inbox.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("transport closed")
    }

    async fn stop(self) {
        self.coordinator.shutdown().await;
        self.engine.shutdown().await;
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn changes_reach_subscribers_on_other_instances() {
    let store = Arc::new(MemoryStore::new());
    let a = Instance::start("a", store.clone());
    let mut b = Instance::start("b", store.clone());
    settle().await;

    let id = b
        .engine
        .subscribe("c1", SubscriptionRequest::new("file:///shared/**"), UserContext::new())
        .await
        .unwrap();

    a.engine
        .publish_change(ResourceChange::updated("file:///shared/x.json", json!({"n": 1})));

    let params = b.next().await;
    assert_eq!(params["subscriptionId"], id.as_str());
    assert_eq!(params["data"], json!({"n": 1}));

    // Received changes are not echoed back onto the channel
    settle().await;
    assert!(b.inbox.try_recv().is_err());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn stats_exclude_instances_past_timeout() {
    let store = Arc::new(MemoryStore::new());
    let a = Instance::start("a", store.clone());
    let b = Instance::start("b", store.clone());

    b.engine
        .subscribe("c1", SubscriptionRequest::new("**"), UserContext::new())
        .await
        .unwrap();
    b.coordinator.heartbeat().await.unwrap();

    let stale = InstanceRecord {
        instance_id: "ghost".into(),
        last_heartbeat: OffsetDateTime::now_utc() - Duration::from_secs(300),
        subscription_count: 7,
    };
    store
        .set(&instance_key("ghost"), &serde_json::to_string(&stale).unwrap(), None)
        .await
        .unwrap();
    store.set_add(INSTANCES_KEY, &["ghost".into()]).await.unwrap();

    let stats = a.coordinator.get_distributed_stats().await;
    assert_eq!(stats.instance_id, "a");
    assert_eq!(stats.other_instances.len(), 1);
    assert_eq!(stats.other_instances[0].instance_id, "b");
    assert_eq!(stats.other_instances[0].subscription_count, 1);
    assert_eq!(stats.total_subscriptions, 1);

    a.coordinator.heartbeat().await.unwrap();
    let members = store.set_members(INSTANCES_KEY).await.unwrap();
    assert!(!members.contains(&"ghost".to_string()));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn store_outage_falls_back_to_local_delivery() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Instance::start("a", store.clone());
    settle().await;

    store.set_available(false);
    assert!(a.coordinator.heartbeat().await.is_err());
    assert!(a.coordinator.is_degraded());

    let id = a
        .engine
        .subscribe("c1", SubscriptionRequest::new("file:///**"), UserContext::new())
        .await
        .unwrap();
    a.engine
        .publish_change(ResourceChange::created("file:///local.json", json!({"ok": true})));
    assert_eq!(a.next().await["data"], json!({"ok": true}));

    store.set_available(true);
    a.coordinator.heartbeat().await.unwrap();
    assert!(!a.coordinator.is_degraded());
    assert_eq!(store.set_members(&subscriptions_key("a")).await.unwrap(), vec![id]);

    a.stop().await;
    assert!(store.get(&instance_key("a")).await.unwrap().is_none());
}
