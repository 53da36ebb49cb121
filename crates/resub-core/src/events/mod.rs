//! Resource change events.
//!
//! Every mutation of a served resource is described by a [`ResourceChange`] and
//! published on a [`ChangeBroadcaster`]. The notification dispatcher and, in
//! distributed mode, the cross-instance forwarder consume the same bus.
//!
//! ```text
//!   resource mutation
//!          │
//!          ▼
//!   ChangeBroadcaster ──────────────┐
//!          │                        │
//!          ▼                        ▼
//!   NotificationDispatcher    change forwarder
//!   (local registry)          (shared channel)
//! ```

pub mod broadcaster;
pub mod types;

pub use broadcaster::ChangeBroadcaster;
pub use types::{ChangeType, ResourceChange};
