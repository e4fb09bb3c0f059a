//! Typed identifiers shared across execution components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Stable query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one node within a plan fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanNodeId(
    /// Raw numeric id value.
    pub i32,
);

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a tuple layout (materialized source row or accumulator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TupleId(
    /// Raw numeric id value.
    pub i32,
);

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ids that can be minted from a dense integer sequence.
pub trait SequentialId: Copy {
    /// Build the id for a sequence position.
    fn from_seq(seq: i32) -> Self;
}

impl SequentialId for TupleId {
    fn from_seq(seq: i32) -> Self {
        TupleId(seq)
    }
}

impl SequentialId for PlanNodeId {
    fn from_seq(seq: i32) -> Self {
        PlanNodeId(seq)
    }
}

/// Hands out ids `0, 1, 2, ...` for one fragment.
#[derive(Debug)]
pub struct IdGenerator<T> {
    next: i32,
    _marker: PhantomData<T>,
}

impl<T: SequentialId> IdGenerator<T> {
    /// Generator starting at id 0.
    pub fn new() -> Self {
        Self {
            next: 0,
            _marker: PhantomData,
        }
    }

    /// Mint the next id.
    pub fn next_id(&mut self) -> T {
        let id = T::from_seq(self.next);
        self.next += 1;
        id
    }

    /// Largest id minted so far, or `None` before the first call to `next_id`.
    pub fn max_id(&self) -> Option<T> {
        (self.next > 0).then(|| T::from_seq(self.next - 1))
    }
}

impl<T: SequentialId> Default for IdGenerator<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_ids_are_dense_and_tracked() {
        let mut generator = IdGenerator::<TupleId>::new();
        assert_eq!(generator.max_id(), None);
        assert_eq!(generator.next_id(), TupleId(0));
        assert_eq!(generator.next_id(), TupleId(1));
        assert_eq!(generator.max_id(), Some(TupleId(1)));
    }
}
