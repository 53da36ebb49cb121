//! Transformation pipeline.
//!
//! An ordered list of [`Transformer`] stages applied to every notification
//! payload after field projection. Each stage receives the previous stage's
//! output. A failing or panicking stage aborts the pipeline for that one
//! notification only.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use resub_core::ChangeType;
use serde_json::Value;

use super::error::TransformerError;
use super::types::Subscription;

/// What a transformer knows about the notification it is shaping.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub uri: String,
    pub change_type: ChangeType,
    pub subscription: Arc<Subscription>,
}

/// One pipeline stage.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Stable identifier, unique within a pipeline.
    fn id(&self) -> &str;

    fn enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    async fn transform(&self, payload: Value, ctx: &TransformContext) -> anyhow::Result<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Transformer `{0}` is already registered")]
    DuplicateId(String),

    #[error("Transformer `{0}` not found")]
    NotFound(String),
}

#[derive(Default)]
pub struct TransformationPipeline {
    stages: RwLock<Vec<Arc<dyn Transformer>>>,
}

impl TransformationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Append a stage. Ids must be unique.
    pub fn add_transformer(&self, transformer: Arc<dyn Transformer>) -> Result<(), PipelineError> {
        let mut stages = self.stages.write();
        if stages.iter().any(|t| t.id() == transformer.id()) {
            return Err(PipelineError::DuplicateId(transformer.id().to_string()));
        }
        tracing::debug!(transformer_id = %transformer.id(), "Transformer registered");
        stages.push(transformer);
        Ok(())
    }

    pub fn remove_transformer(&self, id: &str) -> bool {
        let mut stages = self.stages.write();
        let before = stages.len();
        stages.retain(|t| t.id() != id);
        stages.len() != before
    }

    /// Move a stage to `index`, clamped to the end of the pipeline.
    pub fn move_transformer(&self, id: &str, index: usize) -> Result<(), PipelineError> {
        let mut stages = self.stages.write();
        let from = stages
            .iter()
            .position(|t| t.id() == id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        let stage = stages.remove(from);
        let to = index.min(stages.len());
        stages.insert(to, stage);
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), PipelineError> {
        let stages = self.stages.read();
        let stage = stages
            .iter()
            .find(|t| t.id() == id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        stage.set_enabled(enabled);
        Ok(())
    }

    pub fn transformer_ids(&self) -> Vec<String> {
        self.stages.read().iter().map(|t| t.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.read().is_empty()
    }

    /// Run every enabled stage in order.
    ///
    /// Works on a snapshot of the stage list, so concurrent add/remove calls
    /// affect the next notification, not this one.
    pub async fn apply(
        &self,
        payload: Value,
        ctx: &TransformContext,
    ) -> Result<Value, TransformerError> {
        let snapshot: Vec<Arc<dyn Transformer>> = self.stages.read().clone();

        let mut payload = payload;
        for stage in snapshot {
            if !stage.enabled() {
                tracing::trace!(transformer_id = %stage.id(), "Skipping disabled transformer");
                continue;
            }

            let result = AssertUnwindSafe(stage.transform(payload, ctx))
                .catch_unwind()
                .await;
            payload = match result {
                Ok(Ok(next)) => next,
                Ok(Err(error)) => {
                    return Err(TransformerError {
                        transformer_id: stage.id().to_string(),
                        error,
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(
                        transformer_id = %stage.id(),
                        panic = %message,
                        "Transformer panicked"
                    );
                    return Err(TransformerError {
                        transformer_id: stage.id().to_string(),
                        error: anyhow::anyhow!("panicked: {message}"),
                    });
                }
            };
        }
        Ok(payload)
    }
}

impl std::fmt::Debug for TransformationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationPipeline")
            .field("stages", &self.transformer_ids())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::transformers::FnTransformer;
    use crate::subscriptions::types::UserContext;
    use resub_core::UriPattern;
    use serde_json::json;

    fn ctx() -> TransformContext {
        TransformContext {
            uri: "file:///a.json".into(),
            change_type: ChangeType::Updated,
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

    fn tag(id: &str) -> Arc<dyn Transformer> {
        let label = id.to_string();
        Arc::new(FnTransformer::new(id, move |mut payload: Value, _ctx| {
            let label = label.clone();
            async move {
                if let Some(trail) = payload.get_mut("trail").and_then(Value::as_array_mut) {
                    trail.push(json!(label));
                }
                Ok(payload)
            }
        }))
    }

    #[tokio::test]
    async fn stages_run_in_order_and_skip_disabled() {
        let pipeline = TransformationPipeline::new();
        pipeline.add_transformer(tag("a")).unwrap();
        pipeline.add_transformer(tag("b")).unwrap();
        pipeline.add_transformer(tag("c")).unwrap();
        pipeline.set_enabled("b", false).unwrap();

        let out = pipeline.apply(json!({"trail": []}), &ctx()).await.unwrap();
        assert_eq!(out["trail"], json!(["a", "c"]));
        assert_eq!(pipeline.transformer_ids(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn move_reorders_stages() {
        let pipeline = TransformationPipeline::new();
        pipeline.add_transformer(tag("a")).unwrap();
        pipeline.add_transformer(tag("b")).unwrap();
        pipeline.move_transformer("b", 0).unwrap();

        let out = pipeline.apply(json!({"trail": []}), &ctx()).await.unwrap();
        assert_eq!(out["trail"], json!(["b", "a"]));
        assert!(matches!(
            pipeline.move_transformer("zz", 0),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let pipeline = TransformationPipeline::new();
        pipeline.add_transformer(tag("a")).unwrap();
        assert!(matches!(
            pipeline.add_transformer(tag("a")),
            Err(PipelineError::DuplicateId(_))
        ));
        assert!(pipeline.remove_transformer("a"));
        assert!(!pipeline.remove_transformer("a"));
        assert!(pipeline.is_empty());
    }

    #[tokio::test]
    async fn failing_stage_reports_its_id() {
        let pipeline = TransformationPipeline::new();
        pipeline.add_transformer(tag("a")).unwrap();
        pipeline
            .add_transformer(Arc::new(FnTransformer::new("broken", |_payload, _ctx| async {
                Err(anyhow::anyhow!("lookup failed"))
            })))
            .unwrap();

        let err = pipeline.apply(json!({"trail": []}), &ctx()).await.unwrap_err();
        assert_eq!(err.transformer_id, "broken");
    }

    #[tokio::test]
    async fn panicking_stage_becomes_an_error() {
        let pipeline = TransformationPipeline::new();
        pipeline
            .add_transformer(Arc::new(FnTransformer::new("panics", |_payload, _ctx| async {
                if true {
                    panic!("stage exploded");
                }
                Ok(Value::Null)
            })))
            .unwrap();

        let err = pipeline.apply(json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.transformer_id, "panics");
        assert!(err.to_string().contains("stage exploded"));
    }
}
