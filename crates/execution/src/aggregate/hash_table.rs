//! Group hash table with per-level hash seeds.
//!
//! Groups live in an insertion-ordered entry vector; an open-addressing
//! directory of entry indexes sits on top. Raising the hash level swaps the
//! seed and rebuilds the directory from the stored keys.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tundra_common::{Result, TundraError, MAX_HASH_LEVEL};

use crate::expressions::PhysicalExpr;
use crate::scalar::ScalarValue;

const EMPTY: u32 = u32::MAX;
const MIN_SLOTS: usize = 16;
/// Directory grows past 70% load.
const LOAD_NUM: usize = 7;
const LOAD_DEN: usize = 10;

pub fn hash_key_with_seed(key: &[ScalarValue], seed: u64) -> u64 {
    let mut h = DefaultHasher::new();
    seed.hash(&mut h);
    key.hash(&mut h);
    h.finish()
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Hashing context shared by the build and probe sides of a grouping.
///
/// Holds one seed per hash level. `build_exprs` evaluate group keys over the
/// intermediate layout, `probe_exprs` over raw input rows.
pub struct HashTableCtx {
    level: u8,
    seeds: Vec<u64>,
    build_exprs: Vec<Arc<dyn PhysicalExpr>>,
    probe_exprs: Vec<Arc<dyn PhysicalExpr>>,
}

impl HashTableCtx {
    pub fn new(
        base_seed: u64,
        build_exprs: Vec<Arc<dyn PhysicalExpr>>,
        probe_exprs: Vec<Arc<dyn PhysicalExpr>>,
    ) -> Self {
        let seeds = (0..=MAX_HASH_LEVEL)
            .map(|level| splitmix64(base_seed ^ u64::from(level)))
            .collect();
        Self {
            level: 0,
            seeds,
            build_exprs,
            probe_exprs,
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Switch to `level`. Levels above [`MAX_HASH_LEVEL`] are an internal error.
    pub fn set_level(&mut self, level: u8) -> Result<()> {
        if level > MAX_HASH_LEVEL {
            return Err(TundraError::Internal(format!(
                "hash level {level} exceeds maximum {MAX_HASH_LEVEL}"
            )));
        }
        self.level = level;
        Ok(())
    }

    /// Seed of the current level.
    pub fn hash_seed(&self) -> u64 {
        self.seeds[usize::from(self.level)]
    }

    pub fn seed_for_level(&self, level: u8) -> Option<u64> {
        self.seeds.get(usize::from(level)).copied()
    }

    pub fn build_expr_evals(&self) -> &[Arc<dyn PhysicalExpr>] {
        &self.build_exprs
    }

    pub fn probe_expr_evals(&self) -> &[Arc<dyn PhysicalExpr>] {
        &self.probe_exprs
    }

    pub fn hash_key(&self, key: &[ScalarValue]) -> u64 {
        hash_key_with_seed(key, self.hash_seed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

/// Insertion point returned by [`GroupHashTable::find`] for a missing key.
///
/// Only valid until the next insert or rehash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VacantSlot {
    slot: usize,
    hash: u64,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Found(GroupId),
    Vacant(VacantSlot),
}

struct Entry<S> {
    hash: u64,
    key: Vec<ScalarValue>,
    state: S,
}

pub struct GroupHashTable<S> {
    entries: Vec<Entry<S>>,
    directory: Vec<u32>,
    key_bytes: usize,
    epoch: u64,
}

impl<S> Default for GroupHashTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> GroupHashTable<S> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            directory: vec![EMPTY; MIN_SLOTS],
            key_bytes: 0,
            epoch: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn mask(&self) -> usize {
        self.directory.len() - 1
    }

    pub fn find(&self, hash: u64, key: &[ScalarValue]) -> Probe {
        let mask = self.mask();
        let mut slot = (hash as usize) & mask;
        loop {
            let idx = self.directory[slot];
            if idx == EMPTY {
                return Probe::Vacant(VacantSlot {
                    slot,
                    hash,
                    epoch: self.epoch,
                });
            }
            let entry = &self.entries[idx as usize];
            if entry.hash == hash && entry.key == key {
                return Probe::Found(GroupId(idx));
            }
            slot = (slot + 1) & mask;
        }
    }

    /// Add a new group at `vacant`, which must come from the latest `find`
    /// for the same `hash`.
    pub fn insert(
        &mut self,
        vacant: VacantSlot,
        hash: u64,
        key: Vec<ScalarValue>,
        state: S,
    ) -> Result<GroupId> {
        if vacant.epoch != self.epoch || vacant.hash != hash {
            return Err(TundraError::Internal(
                "stale or mismatched vacant slot in group hash table".to_string(),
            ));
        }
        if self.directory[vacant.slot] != EMPTY {
            return Err(TundraError::Internal(format!(
                "group hash table slot {} already occupied",
                vacant.slot
            )));
        }
        let idx = u32::try_from(self.entries.len())
            .ok()
            .filter(|i| *i != EMPTY)
            .ok_or_else(|| TundraError::Internal("too many groups".to_string()))?;
        self.key_bytes += key.iter().map(ScalarValue::estimate_bytes).sum::<usize>();
        self.entries.push(Entry { hash, key, state });
        self.epoch += 1;
        if self.entries.len() * LOAD_DEN > self.directory.len() * LOAD_NUM {
            self.rebuild_directory(self.directory.len() * 2);
        } else {
            self.directory[vacant.slot] = idx;
        }
        Ok(GroupId(idx))
    }

    pub fn state(&self, id: GroupId) -> Option<&S> {
        self.entries.get(id.0 as usize).map(|e| &e.state)
    }

    pub fn state_mut(&mut self, id: GroupId) -> Option<&mut S> {
        self.entries.get_mut(id.0 as usize).map(|e| &mut e.state)
    }

    /// Groups in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (GroupId, &[ScalarValue], &S)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (GroupId(i as u32), e.key.as_slice(), &e.state))
    }

    /// Recompute every stored hash with `hasher` and rebuild the directory.
    pub fn rehash(&mut self, hasher: impl Fn(&[ScalarValue]) -> u64) {
        for entry in &mut self.entries {
            entry.hash = hasher(&entry.key);
        }
        self.epoch += 1;
        self.rebuild_directory(self.directory.len());
    }

    /// Keys, directory and a fixed per-entry overhead. States are not counted.
    pub fn estimated_bytes(&self) -> usize {
        self.key_bytes
            + self.directory.len() * std::mem::size_of::<u32>()
            + self.entries.len() * std::mem::size_of::<Entry<S>>()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.directory = vec![EMPTY; MIN_SLOTS];
        self.key_bytes = 0;
        self.epoch += 1;
    }

    fn rebuild_directory(&mut self, slots: usize) {
        let slots = slots.max(MIN_SLOTS).next_power_of_two();
        self.directory = vec![EMPTY; slots];
        let mask = slots - 1;
        for (i, entry) in self.entries.iter().enumerate() {
            let mut slot = (entry.hash as usize) & mask;
            while self.directory[slot] != EMPTY {
                slot = (slot + 1) & mask;
            }
            self.directory[slot] = i as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i64) -> Vec<ScalarValue> {
        vec![ScalarValue::Int64(v), ScalarValue::Utf8(format!("k{}", v % 7))]
    }

    fn upsert(table: &mut GroupHashTable<i64>, ctx: &HashTableCtx, k: Vec<ScalarValue>) -> GroupId {
        let hash = ctx.hash_key(&k);
        match table.find(hash, &k) {
            Probe::Found(id) => {
                *table.state_mut(id).expect("state") += 1;
                id
            }
            Probe::Vacant(v) => table.insert(v, hash, k, 1).expect("insert"),
        }
    }

    #[test]
    fn grows_and_keeps_insertion_order() {
        let ctx = HashTableCtx::new(7, Vec::new(), Vec::new());
        let mut table = GroupHashTable::new();
        for round in 0..2 {
            for v in 0..1000 {
                let id = upsert(&mut table, &ctx, key(v));
                if round == 0 {
                    assert_eq!(id, GroupId(v as u32));
                }
            }
        }
        assert_eq!(table.len(), 1000);
        assert!(table.iter().all(|(_, _, count)| *count == 2));
        let firsts: Vec<_> = table.iter().take(3).map(|(_, k, _)| k[0].clone()).collect();
        assert_eq!(
            firsts,
            vec![ScalarValue::Int64(0), ScalarValue::Int64(1), ScalarValue::Int64(2)]
        );
    }

    #[test]
    fn levels_use_independent_seeds() {
        let mut ctx = HashTableCtx::new(42, Vec::new(), Vec::new());
        let seeds: std::collections::HashSet<_> =
            (0..=MAX_HASH_LEVEL).filter_map(|l| ctx.seed_for_level(l)).collect();
        assert_eq!(seeds.len(), usize::from(MAX_HASH_LEVEL) + 1);

        // Keys colliding in the low bits at level 0 must mostly separate at level 1.
        let buckets = 8_u64;
        let colliding: Vec<_> = (0..10_000)
            .map(key)
            .filter(|k| ctx.hash_key(k) % buckets == 0)
            .collect();
        assert!(colliding.len() > 100);
        ctx.set_level(1).expect("level 1");
        let still = colliding
            .iter()
            .filter(|k| ctx.hash_key(k) % buckets == 0)
            .count();
        assert!(still * 4 < colliding.len(), "{still} of {} still collide", colliding.len());
        assert!(ctx.set_level(MAX_HASH_LEVEL + 1).is_err());
    }

    #[test]
    fn rehash_keeps_every_group_reachable() {
        let mut ctx = HashTableCtx::new(1, Vec::new(), Vec::new());
        let mut table = GroupHashTable::new();
        for v in 0..200 {
            upsert(&mut table, &ctx, key(v));
        }
        ctx.set_level(3).expect("level");
        table.rehash(|k| ctx.hash_key(k));
        for v in 0..200 {
            let k = key(v);
            assert_eq!(table.find(ctx.hash_key(&k), &k), Probe::Found(GroupId(v as u32)));
        }
    }

    #[test]
    fn stale_vacant_slot_is_rejected() {
        let ctx = HashTableCtx::new(0, Vec::new(), Vec::new());
        let mut table: GroupHashTable<i64> = GroupHashTable::new();
        let (a, b) = (key(1), key(2));
        let (ha, hb) = (ctx.hash_key(&a), ctx.hash_key(&b));
        let Probe::Vacant(va) = table.find(ha, &a) else {
            panic!("empty table");
        };
        let Probe::Vacant(vb) = table.find(hb, &b) else {
            panic!("empty table");
        };
        table.insert(va, ha, a, 0).expect("first insert");
        let err = table.insert(vb, hb, b, 0).expect_err("stale slot");
        assert_eq!(err.kind(), tundra_common::ErrorKind::Internal);
    }
}
