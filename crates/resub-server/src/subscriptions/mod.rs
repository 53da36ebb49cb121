//! Resource subscriptions and change notifications.
//!
//! ## Architecture
//!
//! ```text
//! ResourceChange
//!        ↓
//! ChangeBroadcaster → NotificationDispatcher
//!        ↓
//! SubscriptionRegistry::find_matching (prefix index + wildcard match)
//!        ↓
//! DeliveryManager (one ordered worker per connection, global concurrency cap)
//!        ↓
//! project → TransformationPipeline → maybe_compress
//!        ↓
//! NotificationTransport (WebSocket hub)
//! ```
//!
//! Client requests (`resources/subscribe`, `resources/batch_subscribe`, ...)
//! enter through [`handlers::handle_request`] and go to the
//! [`SubscriptionEngine`].

pub mod delivery;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod listing;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod transformers;
pub mod types;

pub use delivery::{
    DeliveryManager, DeliverySettings, DispatchStats, DispatchStatsSnapshot, NotificationTransport,
};
pub use dispatcher::NotificationDispatcher;
pub use engine::{EngineStats, SubscriptionEngine, SubscriptionEngineBuilder};
pub use error::{DeliveryError, SubscriptionError, SubscriptionResult, TransformerError};
pub use handlers::{Session, handle_message, handle_request};
pub use listing::ResourcePage;
pub use pipeline::{PipelineError, TransformContext, TransformationPipeline, Transformer};
pub use provider::{
    AllowAll, Authorizer, MemoryResourceProvider, ResourceDescriptor, ResourceProvider,
};
pub use registry::{RegistryObserver, SubscriptionRegistry};
pub use transformers::{
    AggregationTransformer, DataEnrichmentTransformer, FnTransformer, FormatConverterTransformer,
};
pub use types::{
    Action, BatchItemResult, BatchItemStatus, BatchSubscribeReport, BatchUnsubscribeReport,
    DeliveryStage, ResourceUpdatedParams, Subscription, SubscriptionRequest, UserContext,
};
