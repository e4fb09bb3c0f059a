//! Sorted partition key ranges and the row → partition lookup.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tundra_common::{Result, TundraError};

use crate::scalar::ScalarValue;

/// One bound of a partition range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartRangeKey {
    NegInfinite,
    Key(Vec<ScalarValue>),
    PosInfinite,
}

impl PartRangeKey {
    fn try_cmp(&self, other: &Self) -> Result<Ordering> {
        use PartRangeKey::*;
        match (self, other) {
            (NegInfinite, NegInfinite) | (PosInfinite, PosInfinite) => Ok(Ordering::Equal),
            (NegInfinite, _) | (_, PosInfinite) => Ok(Ordering::Less),
            (_, NegInfinite) | (PosInfinite, _) => Ok(Ordering::Greater),
            (Key(a), Key(b)) => cmp_keys(a, b),
        }
    }

    fn cmp_row_key(&self, key: &[ScalarValue]) -> Result<Ordering> {
        match self {
            Self::NegInfinite => Ok(Ordering::Less),
            Self::PosInfinite => Ok(Ordering::Greater),
            Self::Key(bound) => cmp_keys(bound, key),
        }
    }
}

fn cmp_keys(a: &[ScalarValue], b: &[ScalarValue]) -> Result<Ordering> {
    if a.len() != b.len() {
        return Err(TundraError::Evaluation(format!(
            "partition key arity mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    for (x, y) in a.iter().zip(b) {
        let ord = x.try_cmp(y)?;
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}

/// Partition `id` covers keys in `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: i64,
    pub start: PartRangeKey,
    pub end: PartRangeKey,
}

/// Immutable, sorted, non-overlapping set of partition ranges.
#[derive(Debug, Clone, Default)]
pub struct PartitionIndex {
    partitions: Vec<PartitionInfo>,
}

impl PartitionIndex {
    /// Sort `partitions` by start key and reject empty or overlapping ranges.
    pub fn try_new(mut partitions: Vec<PartitionInfo>) -> Result<Self> {
        let mut sort_err = None;
        partitions.sort_by(|a, b| match a.start.try_cmp(&b.start) {
            Ok(ord) => ord,
            Err(e) => {
                sort_err.get_or_insert(e);
                Ordering::Equal
            }
        });
        if let Some(e) = sort_err {
            return Err(TundraError::Construction(format!(
                "partition bounds are not comparable: {e}"
            )));
        }

        for p in &partitions {
            if p.start.try_cmp(&p.end).map_err(construction)? != Ordering::Less {
                return Err(TundraError::Construction(format!(
                    "partition {} has an empty range",
                    p.id
                )));
            }
        }
        for pair in partitions.windows(2) {
            if pair[0].end.try_cmp(&pair[1].start).map_err(construction)? == Ordering::Greater {
                return Err(TundraError::Construction(format!(
                    "partitions {} and {} overlap",
                    pair[0].id, pair[1].id
                )));
            }
        }
        Ok(Self { partitions })
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    /// Id of the partition covering `key`, or `None` when no range does.
    pub fn find(&self, key: &[ScalarValue]) -> Result<Option<i64>> {
        // Count of partitions whose start is <= key.
        let (mut lo, mut hi) = (0, self.partitions.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.partitions[mid].start.cmp_row_key(key)? == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let Some(candidate) = lo.checked_sub(1).map(|i| &self.partitions[i]) else {
            return Ok(None);
        };
        if candidate.end.cmp_row_key(key)? == Ordering::Greater {
            Ok(Some(candidate.id))
        } else {
            Ok(None)
        }
    }
}

fn construction(e: TundraError) -> TundraError {
    TundraError::Construction(format!("invalid partition bounds: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i64) -> PartRangeKey {
        PartRangeKey::Key(vec![ScalarValue::Int64(v)])
    }

    fn part(id: i64, start: PartRangeKey, end: PartRangeKey) -> PartitionInfo {
        PartitionInfo { id, start, end }
    }

    fn index() -> PartitionIndex {
        // Deliberately unsorted; a gap between 20 and 30.
        PartitionIndex::try_new(vec![
            part(30, key(30), PartRangeKey::PosInfinite),
            part(10, PartRangeKey::NegInfinite, key(10)),
            part(20, key(10), key(20)),
        ])
        .expect("valid partitions")
    }

    #[test]
    fn every_covered_key_maps_to_its_range() {
        let idx = index();
        let probe = |v: i64| idx.find(&[ScalarValue::Int64(v)]).expect("find");
        assert_eq!(probe(i64::MIN), Some(10));
        assert_eq!(probe(9), Some(10));
        assert_eq!(probe(10), Some(20));
        assert_eq!(probe(19), Some(20));
        assert_eq!(probe(30), Some(30));
        assert_eq!(probe(i64::MAX), Some(30));
    }

    #[test]
    fn gap_keys_have_no_partition() {
        let idx = index();
        for v in 20..30 {
            assert_eq!(idx.find(&[ScalarValue::Int64(v)]).expect("find"), None);
        }
    }

    #[test]
    fn null_key_sorts_lowest() {
        let idx = index();
        assert_eq!(idx.find(&[ScalarValue::Null]).expect("find"), Some(10));
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let err = PartitionIndex::try_new(vec![
            part(1, key(0), key(10)),
            part(2, key(5), key(15)),
        ])
        .expect_err("overlap");
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn empty_range_is_rejected() {
        assert!(PartitionIndex::try_new(vec![part(1, key(5), key(5))]).is_err());
    }

    #[test]
    fn empty_index_matches_nothing() {
        let idx = PartitionIndex::try_new(Vec::new()).expect("empty");
        assert_eq!(idx.find(&[ScalarValue::Int64(1)]).expect("find"), None);
    }

    #[test]
    fn composite_keys_compare_lexicographically() {
        let k = |a: i64, b: &str| {
            PartRangeKey::Key(vec![ScalarValue::Int64(a), ScalarValue::Utf8(b.to_string())])
        };
        let idx = PartitionIndex::try_new(vec![
            part(1, k(1, "a"), k(1, "m")),
            part(2, k(1, "m"), k(2, "a")),
        ])
        .expect("valid");
        let row = |a: i64, b: &str| vec![ScalarValue::Int64(a), ScalarValue::Utf8(b.to_string())];
        assert_eq!(idx.find(&row(1, "c")).expect("find"), Some(1));
        assert_eq!(idx.find(&row(1, "z")).expect("find"), Some(2));
        assert_eq!(idx.find(&row(2, "a")).expect("find"), None);
    }
}
