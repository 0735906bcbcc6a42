//! Keyed partial aggregates and their merge.
//!
//! Each pool worker owns one [`PartialAggregate`] and folds its own items
//! into it. After the pool has drained, the partials are merged into a
//! single aggregate and ranked. Merging is commutative and associative as
//! long as the counter type's [`Merge`] is, so the result does not depend on
//! how items were spread across workers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::btree_map;

/// A counter that can absorb another counter of the same kind.
pub trait Merge {
    /// Adds `other` into `self`.
    fn merge(&mut self, other: Self);
}

impl Merge for u64 {
    fn merge(&mut self, other: Self) {
        *self += other;
    }
}

impl Merge for usize {
    fn merge(&mut self, other: Self) {
        *self += other;
    }
}

/// Counters keyed by `K`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAggregate<K: Ord, C> {
    entries: BTreeMap<K, C>,
}

impl<K: Ord, C> Default for PartialAggregate<K, C> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord, C: Merge + Default> PartialAggregate<K, C> {
    /// Creates an empty aggregate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `value` into the counter for `key`.
    pub fn record(&mut self, key: K, value: C) {
        self.entry(key).merge(value);
    }

    /// Counter for `key`, created on first use.
    pub fn entry(&mut self, key: K) -> &mut C {
        self.entries.entry(key).or_default()
    }

    /// Merges every counter of `other` into `self`.
    pub fn absorb(&mut self, other: Self) {
        for (key, value) in other.entries {
            match self.entries.entry(key) {
                btree_map::Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                btree_map::Entry::Occupied(mut slot) => slot.get_mut().merge(value),
            }
        }
    }
}

impl<K: Ord, C> PartialAggregate<K, C> {
    /// Counter for `key`, if any item recorded it.
    pub fn get(&self, key: &K) -> Option<&C> {
        self.entries.get(key)
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &C)> {
        self.entries.iter()
    }

    /// Entries sorted by `cmp`, ties broken by key ascending.
    pub fn ranked_by<F>(&self, mut cmp: F) -> Vec<(&K, &C)>
    where
        F: FnMut(&C, &C) -> Ordering,
    {
        let mut ranked: Vec<(&K, &C)> = self.entries.iter().collect();
        // Entries come out of the map in key order and the sort is stable,
        // so equal counters keep ascending keys.
        ranked.sort_by(|a, b| cmp(a.1, b.1));
        ranked
    }

    /// Consumes the aggregate, yielding entries in key order.
    #[must_use]
    pub fn into_inner(self) -> BTreeMap<K, C> {
        self.entries
    }
}

impl<K: Ord, C: Merge + Default> FromIterator<(K, C)> for PartialAggregate<K, C> {
    fn from_iter<T: IntoIterator<Item = (K, C)>>(iter: T) -> Self {
        let mut aggregate = Self::new();
        for (key, value) in iter {
            aggregate.record(key, value);
        }
        aggregate
    }
}

/// Merges worker partials into one aggregate.
pub fn merge<K, C, P>(partials: P) -> PartialAggregate<K, C>
where
    K: Ord,
    C: Merge + Default,
    P: IntoIterator<Item = PartialAggregate<K, C>>,
{
    partials
        .into_iter()
        .fold(PartialAggregate::new(), |mut total, partial| {
            total.absorb(partial);
            total
        })
}
