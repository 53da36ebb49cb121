//! End-to-end tests of the subscription engine through its public API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use resub_core::{ResourceChange, decompress};
use resub_server::config::{CompressionSettings, SubscriptionSettings};
use resub_server::rpc::{RESOURCE_UPDATED_METHOD, RpcNotification};
use resub_server::subscriptions::{
    BatchItemStatus, DataEnrichmentTransformer, DeliveryError, FnTransformer,
    MemoryResourceProvider, NotificationTransport, SubscriptionEngine, SubscriptionError,
    SubscriptionRequest, UserContext,
};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

struct ChannelTransport {
    tx: mpsc::UnboundedSender<(String, RpcNotification)>,
}

#[async_trait]
impl NotificationTransport for ChannelTransport {
    async fn send(
        &self,
        connection_id: &str,
        notification: RpcNotification,
    ) -> Result<(), DeliveryError> {
        self.tx
            .send((connection_id.to_string(), notification))
            .map_err(|_| DeliveryError::ConnectionClosed(connection_id.to_string()))
    }
}

struct Inbox {
    rx: Mutex<mpsc::UnboundedReceiver<(String, RpcNotification)>>,
}

impl Inbox {
    async fn next(&self) -> (String, Value) {
        let received = tokio::time::timeout(Duration::from_secs(2), self.rx.lock().await.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("transport closed");
        assert_eq!(received.1.method, RESOURCE_UPDATED_METHOD);
        (received.0, received.1.params)
    }

    async fn assert_empty(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(self.rx.lock().await.try_recv().is_err());
    }
}

fn transport() -> (Arc<ChannelTransport>, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ChannelTransport { tx }),
        Inbox { rx: Mutex::new(rx) },
    )
}

fn started(engine: Arc<SubscriptionEngine>) -> Arc<SubscriptionEngine> {
    engine.start();
    engine
}

#[tokio::test]
async fn create_then_remove_round_trip() {
    let (transport, inbox) = transport();
    let engine = started(SubscriptionEngine::builder(transport).build());

    let id = engine
        .subscribe("c1", SubscriptionRequest::new("file:///docs/*.json"), UserContext::new())
        .await
        .unwrap();
    assert!(engine.registry().contains(&id));

    engine.publish_change(ResourceChange::updated("file:///docs/a.json", json!({"v": 1})));
    let (connection, params) = inbox.next().await;
    assert_eq!(connection, "c1");
    assert_eq!(params["subscriptionId"], id.as_str());
    assert_eq!(params["data"], json!({"v": 1}));

    engine.unsubscribe(&id, "c1").unwrap();
    assert!(matches!(
        engine.unsubscribe(&id, "c1"),
        Err(SubscriptionError::SubscriptionNotFound(_))
    ));

    engine.publish_change(ResourceChange::updated("file:///docs/a.json", json!({"v": 2})));
    inbox.assert_empty().await;
    engine.shutdown().await;
}

#[tokio::test]
async fn batch_with_one_invalid_pattern_is_partial() {
    let (transport, _inbox) = transport();
    let engine = SubscriptionEngine::builder(transport).build();

    let report = engine
        .batch_subscribe(
            "c1",
            vec![
                SubscriptionRequest::new("file:///a/**").with_name("first"),
                SubscriptionRequest::new("file:///b/[x").with_name("broken"),
                SubscriptionRequest::new("file:///c/*"),
            ],
            UserContext::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.total_requested, 3);
    assert_eq!(report.total_created, 2);
    assert_eq!(report.total_failed, 1);
    assert_eq!(report.results[1].name, "broken");
    assert_eq!(report.results[1].status, BatchItemStatus::Failed);
    assert_eq!(report.results[2].name, "subscription_2");
    assert_eq!(engine.registry().connection_subscriptions("c1").len(), 2);
}

#[tokio::test]
async fn cleanup_connection_is_idempotent() {
    let (transport, inbox) = transport();
    let engine = started(SubscriptionEngine::builder(transport).build());

    for pattern in ["file:///a/**", "file:///b/**"] {
        engine
            .subscribe("c1", SubscriptionRequest::new(pattern), UserContext::new())
            .await
            .unwrap();
    }
    engine
        .subscribe("c2", SubscriptionRequest::new("file:///a/**"), UserContext::new())
        .await
        .unwrap();

    assert_eq!(engine.cleanup_connection("c1"), 2);
    assert_eq!(engine.cleanup_connection("c1"), 0);
    assert_eq!(engine.registry().len(), 1);

    engine.publish_change(ResourceChange::created("file:///a/x", json!({})));
    let (connection, _) = inbox.next().await;
    assert_eq!(connection, "c2");
    inbox.assert_empty().await;
    engine.shutdown().await;
}

#[tokio::test]
async fn projection_keeps_only_selected_fields() {
    let (transport, inbox) = transport();
    let engine = started(SubscriptionEngine::builder(transport).build());

    engine
        .subscribe(
            "c1",
            SubscriptionRequest::new("file:///users/**").with_fields(["name", "address.city"]),
            UserContext::new(),
        )
        .await
        .unwrap();

    engine.publish_change(ResourceChange::updated(
        "file:///users/42.json",
        json!({
            "name": "Ada",
            "age": 36,
            "address": {"city": "London", "zip": "N1"}
        }),
    ));

    let (_, params) = inbox.next().await;
    assert_eq!(params["data"], json!({"name": "Ada", "address": {"city": "London"}}));
    engine.shutdown().await;
}

#[tokio::test]
async fn payload_is_read_from_provider_when_absent() {
    let (transport, inbox) = transport();
    let provider = MemoryResourceProvider::new_shared();
    provider.put("file:///a.json", json!({"from": "provider"}));
    let engine = started(SubscriptionEngine::builder(transport).provider(provider).build());

    engine
        .subscribe("c1", SubscriptionRequest::new("file:///*.json"), UserContext::new())
        .await
        .unwrap();
    engine.publish_change(ResourceChange::touched("file:///a.json"));

    let (_, params) = inbox.next().await;
    assert_eq!(params["data"], json!({"from": "provider"}));

    engine.publish_change(ResourceChange::deleted("file:///a.json"));
    let (_, params) = inbox.next().await;
    assert_eq!(params["type"], "deleted");
    assert!(params.get("data").is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn failing_transformer_only_affects_its_subscription() {
    let (transport, inbox) = transport();
    let engine = started(SubscriptionEngine::builder(transport).build());

    let enrich = DataEnrichmentTransformer::new("enrich");
    enrich.add_enrichment("enriched", |_| async { Ok(json!(true)) });
    engine.pipeline().add_transformer(Arc::new(enrich)).unwrap();
    engine
        .pipeline()
        .add_transformer(Arc::new(FnTransformer::new("picky", |payload, ctx| async move {
            if ctx.subscription.connection_id == "broken" {
                anyhow::bail!("refusing to transform");
            }
            Ok(payload)
        })))
        .unwrap();

    engine
        .subscribe("broken", SubscriptionRequest::new("file:///**"), UserContext::new())
        .await
        .unwrap();
    engine
        .subscribe("healthy", SubscriptionRequest::new("file:///**"), UserContext::new())
        .await
        .unwrap();

    engine.publish_change(ResourceChange::updated("file:///x", json!({"a": 1})));

    let (connection, params) = inbox.next().await;
    assert_eq!(connection, "healthy");
    assert_eq!(params["data"], json!({"a": 1, "enriched": true}));
    inbox.assert_empty().await;

    let stats = engine.stats();
    assert_eq!(stats.dispatch.notifications_delivered, 1);
    assert_eq!(stats.dispatch.notifications_failed, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn large_payloads_are_compressed() {
    let (transport, inbox) = transport();
    let compression = CompressionSettings {
        enable_websocket_compression: true,
        compression_threshold: 128,
        compression_level: 6,
    };
    let engine = started(
        SubscriptionEngine::builder(transport)
            .compression(compression)
            .build(),
    );
    engine
        .subscribe("c1", SubscriptionRequest::new("**"), UserContext::new())
        .await
        .unwrap();

    let large = json!({"text": "abc".repeat(400)});
    engine.publish_change(ResourceChange::updated("file:///big", large.clone()));
    let (_, params) = inbox.next().await;
    assert_eq!(params["compressed"], true);
    assert_eq!(params["compression_type"], "gzip");
    assert!(params["compressed_size"].as_u64() < params["original_size"].as_u64());

    let bytes = STANDARD.decode(params["data"].as_str().unwrap()).unwrap();
    let restored: Value = serde_json::from_slice(&decompress(&bytes).unwrap()).unwrap();
    assert_eq!(restored, large);

    engine.publish_change(ResourceChange::updated("file:///small", json!({"a": 1})));
    let (_, params) = inbox.next().await;
    assert_eq!(params["compressed"], false);
    assert_eq!(params["data"], json!({"a": 1}));
    engine.shutdown().await;
}

#[tokio::test]
async fn notifications_keep_per_connection_order() {
    let (transport, inbox) = transport();
    let settings = SubscriptionSettings {
        max_concurrent_deliveries: 4,
        ..SubscriptionSettings::default()
    };
    let engine = started(SubscriptionEngine::builder(transport).settings(settings).build());
    engine
        .subscribe("c1", SubscriptionRequest::new("file:///counter"), UserContext::new())
        .await
        .unwrap();

    for seq in 0..25 {
        engine.publish_change(ResourceChange::updated("file:///counter", json!({"seq": seq})));
    }
    for seq in 0..25 {
        let (_, params) = inbox.next().await;
        assert_eq!(params["data"]["seq"], seq);
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn per_connection_limit_is_enforced() {
    let (transport, _inbox) = transport();
    let settings = SubscriptionSettings {
        max_subscriptions_per_connection: 1,
        ..SubscriptionSettings::default()
    };
    let engine = SubscriptionEngine::builder(transport).settings(settings).build();

    engine
        .subscribe("c1", SubscriptionRequest::new("**"), UserContext::new())
        .await
        .unwrap();
    let err = engine
        .subscribe("c1", SubscriptionRequest::new("**"), UserContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::SubscriptionLimitExceeded { .. }));

    // Other connections have their own budget
    assert!(
        engine
            .subscribe("c2", SubscriptionRequest::new("**"), UserContext::new())
            .await
            .is_ok()
    );
}
