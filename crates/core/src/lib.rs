//! `tether-core`: records, schema metadata and the type codec.
//!
//! This crate is pure: no IO, no async. Everything that talks to a store,
//! a cache backend or a transport lives in `tether-infra`.

pub mod codec;
pub mod error;
pub mod filter;
pub mod id;
pub mod mutation;
pub mod record;
pub mod schema;

pub use codec::CodecError;
pub use error::{PropagationFailure, PropagationStepFailure, TetherError, TetherResult};
pub use filter::{Filter, canonical_json};
pub use id::{ConnectionId, SubscriptionId, Uid};
pub use mutation::{MutationEvent, MutationPatch, Operation};
pub use record::{Fields, Record};
pub use schema::{
    BuiltinDefault, Cardinality, CollectionSchema, FieldDecl, FieldDefault, FieldType, LinkConfig,
    Schema,
};
