//! Primary store boundary.
//!
//! The engine wraps a document store it does not own. This module defines the
//! collaborator interface plus an in-memory implementation for tests/dev.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryStore;
pub use r#trait::{
    PrimaryStore, QueryOptions, SortKey, SortOrder, StoreError, UpdateOptions, UpdateOutcome,
};
