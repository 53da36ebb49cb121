//! Multi-instance coordination over a shared store.
//!
//! Key layout:
//! - `resub:instances`: set of live instance ids
//! - `resub:instance:{id}`: JSON [`InstanceRecord`], refreshed on heartbeat
//! - `resub:instance:{id}:subscriptions`: mirrored subscription ids
//!
//! Changes travel on the `resub:resource_changes` pub/sub channel.

pub mod coordinator;
pub mod redis;
pub mod store;

pub use coordinator::{
    CoordinationError, CoordinatorSettings, DistributedCoordinator, DistributedStats,
    InstanceRecord, RemoteInstance,
};
pub use self::redis::RedisStore;
pub use store::{MemoryStore, SharedStore, StoreError, StoreResult};

pub const INSTANCES_KEY: &str = "resub:instances";
pub const CHANGES_CHANNEL: &str = "resub:resource_changes";

pub fn instance_key(instance_id: &str) -> String {
    format!("resub:instance:{instance_id}")
}

pub fn subscriptions_key(instance_id: &str) -> String {
    format!("resub:instance:{instance_id}:subscriptions")
}
