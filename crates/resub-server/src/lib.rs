pub mod config;
pub mod distributed;
pub mod metrics;
pub mod observability;
pub mod rpc;
pub mod server;
pub mod subscriptions;

pub use config::AppConfig;
pub use distributed::{DistributedCoordinator, MemoryStore, RedisStore, SharedStore};
pub use server::{AppState, ConnectionHub, build_app};
pub use subscriptions::{SubscriptionEngine, SubscriptionError};
