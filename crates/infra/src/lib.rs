//! `tether-infra`: stores, relation propagation, lifecycle hooks, cache,
//! live subscriptions and the transport adapter.
//!
//! Wiring, bottom-up:
//!
//! ```text
//! PrimaryStore ─┬─> Propagator ──> LinkedStore ──publish──> EventBus
//!               │                                              │
//!               └──────────────> SubscriptionRegistry <────────┘
//!                                        │ push
//!                                        v
//!                                    Transport
//! ```

pub mod cache;
pub mod config;
pub mod hooks;
pub mod relations;
pub mod store;
pub mod subscriptions;
pub mod transport;

pub use cache::{CacheBackend, CacheError, CacheStore, InMemoryCacheBackend};
pub use config::TetherConfig;
pub use hooks::{LinkedStore, Mutation};
pub use relations::{ConsistencySweep, Propagator, RelationGraph, RetryPolicy, SweepHandle};
pub use store::{InMemoryStore, PrimaryStore, QueryOptions, StoreError, UpdateOptions};
pub use subscriptions::SubscriptionRegistry;
pub use transport::{ChannelTransport, ClientMessage, Transport};

#[cfg(test)]
mod test_support;
