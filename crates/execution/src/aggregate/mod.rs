//! Hash aggregation.
//!
//! [`AggregationNode`] groups rows through a [`GroupHashTable`] whose seed is
//! chosen by a hash level held in [`HashTableCtx`]. Partial results use an
//! intermediate layout that a `Merge`-mode node can consume.

mod accumulator;
mod hash_table;
mod node;

pub use accumulator::{AggExpr, AggState};
pub use hash_table::{hash_key_with_seed, GroupHashTable, GroupId, HashTableCtx, Probe, VacantSlot};
pub use node::{AggregateMode, AggregationNode};
