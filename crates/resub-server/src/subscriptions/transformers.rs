//! Built-in pipeline stages.
//!
//! Functions registered on a transformer can be added after the transformer
//! has been placed in a pipeline; they take effect on the next notification.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, try_join_all};
use parking_lot::RwLock;
use resub_core::projection::get_path_mut;
use serde_json::Value;

use super::pipeline::{TransformContext, Transformer};

type EnrichmentFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type ConversionFn = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;
type DataSourceFn = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type TransformFn =
    Arc<dyn Fn(Value, TransformContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

fn require_object(payload: &Value, transformer: &str) -> anyhow::Result<()> {
    if payload.is_object() {
        Ok(())
    } else {
        anyhow::bail!("{transformer} requires an object payload")
    }
}

/// Adds computed fields.
///
/// Every enrichment function receives the payload as it entered this stage;
/// results are merged in registration order, so a later function registered
/// under the same field wins.
pub struct DataEnrichmentTransformer {
    id: String,
    enabled: AtomicBool,
    enrichments: RwLock<Vec<(String, EnrichmentFn)>>,
}

impl DataEnrichmentTransformer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            enrichments: RwLock::new(Vec::new()),
        }
    }

    pub fn add_enrichment<F, Fut>(&self, field: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let f: EnrichmentFn = Arc::new(move |payload| f(payload).boxed());
        self.enrichments.write().push((field.into(), f));
    }
}

#[async_trait]
impl Transformer for DataEnrichmentTransformer {
    fn id(&self) -> &str {
        &self.id
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    async fn transform(&self, mut payload: Value, _ctx: &TransformContext) -> anyhow::Result<Value> {
        require_object(&payload, "data enrichment")?;
        let enrichments = self.enrichments.read().clone();

        let mut computed = Vec::with_capacity(enrichments.len());
        for (field, f) in enrichments {
            computed.push((field, f(payload.clone()).await?));
        }

        if let Some(object) = payload.as_object_mut() {
            for (field, value) in computed {
                object.insert(field, value);
            }
        }
        Ok(payload)
    }
}

/// Rewrites individual field values in place.
///
/// Field names are dot paths; a conversion is skipped when its field is absent.
pub struct FormatConverterTransformer {
    id: String,
    enabled: AtomicBool,
    conversions: RwLock<Vec<(String, ConversionFn)>>,
}

impl FormatConverterTransformer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            conversions: RwLock::new(Vec::new()),
        }
    }

    pub fn add_conversion<F>(&self, field: impl Into<String>, f: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.conversions.write().push((field.into(), Arc::new(f)));
    }
}

#[async_trait]
impl Transformer for FormatConverterTransformer {
    fn id(&self) -> &str {
        &self.id
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    async fn transform(&self, mut payload: Value, _ctx: &TransformContext) -> anyhow::Result<Value> {
        let conversions = self.conversions.read().clone();
        for (field, convert) in conversions {
            if let Some(slot) = get_path_mut(&mut payload, &field) {
                let old = slot.take();
                *slot = convert(old)?;
            }
        }
        Ok(payload)
    }
}

/// Joins in related data fetched by URI from named sources.
///
/// Sources are queried concurrently; the stage fails if any source fails.
pub struct AggregationTransformer {
    id: String,
    enabled: AtomicBool,
    sources: RwLock<Vec<(String, DataSourceFn)>>,
}

impl AggregationTransformer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            sources: RwLock::new(Vec::new()),
        }
    }

    pub fn add_data_source<F, Fut>(&self, field: impl Into<String>, f: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let f: DataSourceFn = Arc::new(move |uri| f(uri).boxed());
        self.sources.write().push((field.into(), f));
    }
}

#[async_trait]
impl Transformer for AggregationTransformer {
    fn id(&self) -> &str {
        &self.id
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    async fn transform(&self, mut payload: Value, ctx: &TransformContext) -> anyhow::Result<Value> {
        require_object(&payload, "aggregation")?;
        let sources = self.sources.read().clone();

        let fetched = try_join_all(sources.iter().map(|(_, fetch)| fetch(ctx.uri.clone()))).await?;

        if let Some(object) = payload.as_object_mut() {
            for ((field, _), value) in sources.into_iter().zip(fetched) {
                object.insert(field, value);
            }
        }
        Ok(payload)
    }
}

/// A stage backed by a closure, for extensions that need no dedicated type.
pub struct FnTransformer {
    id: String,
    enabled: AtomicBool,
    f: TransformFn,
}

impl FnTransformer {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, TransformContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            f: Arc::new(move |payload, ctx| f(payload, ctx).boxed()),
        }
    }
}

#[async_trait]
impl Transformer for FnTransformer {
    fn id(&self) -> &str {
        &self.id
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    async fn transform(&self, payload: Value, ctx: &TransformContext) -> anyhow::Result<Value> {
        (self.f)(payload, ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::types::{Subscription, UserContext};
    use resub_core::{ChangeType, UriPattern};
    use serde_json::json;

    fn ctx() -> TransformContext {
        TransformContext {
            uri: "file:///docs/a.json".into(),
            change_type: ChangeType::Created,
            subscription: Arc::new(Subscription::new(
                "s1".into(),
                "c1".into(),
                UriPattern::parse("file:///**").unwrap(),
                None,
                None,
                UserContext::new(),
            )),
        }
    }

    #[tokio::test]
    async fn enrichment_merges_in_registration_order() {
        let t = DataEnrichmentTransformer::new("enrich");
        t.add_enrichment("size_class", |payload: Value| async move {
            let size = payload["size"].as_u64().unwrap_or(0);
            Ok(json!(if size > 100 { "large" } else { "small" }))
        });
        t.add_enrichment("label", |_| async { Ok(json!("first")) });
        t.add_enrichment("label", |_| async { Ok(json!("second")) });

        let out = t.transform(json!({"size": 500}), &ctx()).await.unwrap();
        assert_eq!(out, json!({"size": 500, "size_class": "large", "label": "second"}));
    }

    #[tokio::test]
    async fn enrichment_sees_stage_input_not_siblings() {
        let t = DataEnrichmentTransformer::new("enrich");
        t.add_enrichment("a", |_| async { Ok(json!(1)) });
        t.add_enrichment("saw_a", |payload: Value| async move { Ok(json!(payload.get("a").is_some())) });

        let out = t.transform(json!({}), &ctx()).await.unwrap();
        assert_eq!(out["saw_a"], json!(false));
    }

    #[tokio::test]
    async fn enrichment_rejects_scalar_payload() {
        let t = DataEnrichmentTransformer::new("enrich");
        assert!(t.transform(json!(3), &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn conversion_applies_only_to_present_fields() {
        let t = FormatConverterTransformer::new("format");
        t.add_conversion("meta.size", |v| Ok(json!(format!("{} bytes", v))));
        t.add_conversion("missing", |_| Ok(json!("should not appear")));

        let out = t.transform(json!({"meta": {"size": 12}}), &ctx()).await.unwrap();
        assert_eq!(out, json!({"meta": {"size": "12 bytes"}}));
    }

    #[tokio::test]
    async fn aggregation_fetches_by_uri() {
        let t = AggregationTransformer::new("aggregate");
        t.add_data_source("owner", |uri: String| async move { Ok(json!({"for": uri})) });

        let out = t.transform(json!({"id": 1}), &ctx()).await.unwrap();
        assert_eq!(out["owner"]["for"], "file:///docs/a.json");
        assert_eq!(out["id"], 1);
    }

    #[tokio::test]
    async fn toggling_enabled() {
        let t = FnTransformer::new("noop", |payload, _| async move { Ok(payload) });
        assert!(t.enabled());
        t.set_enabled(false);
        assert!(!t.enabled());
    }
}
