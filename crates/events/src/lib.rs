//! In-process event bus and topic naming.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod topic;

pub use bus::{EventBus, Listener, ListenerGuard, PublishReport, listener};
pub use envelope::EventEnvelope;
pub use in_memory_bus::InMemoryEventBus;
pub use topic::Topic;
