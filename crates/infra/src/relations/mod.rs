//! Relational consistency: link resolution, propagation, population and repair.

pub mod graph;
pub mod populate;
pub mod propagator;
pub mod retry;
pub mod sweep;

pub use graph::{OppositeSide, RelationEdge, RelationGraph};
pub use populate::populate;
pub use propagator::{LinkAction, OppositeUpdate, PropagationReport, Propagator, TouchedRecord};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use sweep::{ConsistencySweep, SweepHandle, SweepReport};
