//! Schema-typed side cache.
//!
//! Records are flattened through the type codec into `collection:uid → field → string`
//! hashes on a [`CacheBackend`] and decoded back on read.

pub mod backend;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod store;

use thiserror::Error;

use tether_core::{CodecError, TetherError};

pub use backend::{CacheBackend, InMemoryCacheBackend};
#[cfg(feature = "redis")]
pub use redis_backend::RedisCacheBackend;
pub use store::CacheStore;

/// A field that could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCodecFailure {
    pub field: String,
    pub error: CodecError,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend failure: {0}")]
    Backend(String),

    #[error("no schema for collection `{0}`")]
    UnknownCollection(String),

    /// Some fields were rejected; the rest of the write went through.
    #[error("{} field(s) of `{key}` could not be encoded", .failures.len())]
    Codec {
        key: String,
        failures: Vec<FieldCodecFailure>,
    },
}

impl From<CacheError> for TetherError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Backend(msg) => TetherError::Store(msg),
            CacheError::UnknownCollection(name) => TetherError::not_found(format!("collection `{name}`")),
            CacheError::Codec { mut failures, key } => match failures.pop() {
                Some(failure) => TetherError::Codec(failure.error),
                None => TetherError::Store(format!("codec failure on `{key}`")),
            },
        }
    }
}
