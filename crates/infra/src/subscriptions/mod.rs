//! Live query and document subscriptions.

mod live;
pub mod registry;

pub use registry::{SubscriptionInfo, SubscriptionRegistry};
