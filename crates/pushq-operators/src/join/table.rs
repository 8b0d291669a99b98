//! Join table collaborator.
//!
//! A table is filled once through `add`, sealed with `finish`, then only
//! probed. Every entry may be reachable through several keys (general
//! comparisons bind sequences); a probe reports each entry at most once.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pushq_core::hash::hash_scalar;
use pushq_core::{Cmp, Scalar};

pub trait JoinTable: Send + Sync {
    /// Register `bindings` under every key. `ordinal` is the entry's build
    /// position; matches are reported in ordinal order.
    fn add(&mut self, keys: &[Scalar], bindings: Arc<[Scalar]>, ordinal: u64);

    /// No more `add` calls follow.
    fn finish(&mut self);

    /// Bindings of every entry with a key `b` such that `p <cmp> b` holds
    /// for some probe key `p`.
    fn probe(&self, keys: &[Scalar]) -> Vec<Arc<[Scalar]>>;

    /// Number of entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds a fresh table: (comparison, general comparison, skip sort).
pub type TableFactory = Arc<dyn Fn(Cmp, bool, bool) -> Box<dyn JoinTable> + Send + Sync>;

pub fn default_table_factory() -> TableFactory {
    Arc::new(|cmp: Cmp, _general: bool, skip_sort: bool| -> Box<dyn JoinTable> {
        Box::new(MultiKeyTable::new(cmp, skip_sort))
    })
}

struct Entry {
    ordinal: u64,
    bindings: Arc<[Scalar]>,
}

/// Hash buckets for `Eq`, a sorted key index for range comparisons, and a
/// scan for `Ne`. Null keys are never stored and never match.
pub struct MultiKeyTable {
    cmp: Cmp,
    skip_sort: bool,
    entries: Vec<Entry>,
    buckets: HashMap<u64, Vec<(Scalar, usize)>>,
    keys: Vec<(Scalar, usize)>,
    sorted: bool,
}

impl MultiKeyTable {
    pub fn new(cmp: Cmp, skip_sort: bool) -> Self {
        Self {
            cmp,
            skip_sort,
            entries: Vec::new(),
            buckets: HashMap::new(),
            keys: Vec::new(),
            sorted: true,
        }
    }

    fn collect_range(&self, p: &Scalar, hits: &mut Vec<usize>) {
        // First key >= p, first key > p.
        let lo = self.keys.partition_point(|(k, _)| k.compare(p) == Ordering::Less);
        let hi = self.keys.partition_point(|(k, _)| k.compare(p) != Ordering::Greater);
        // Read from the key side: keys k with k <swapped> p.
        let range = match self.cmp.swap() {
            Cmp::Gt => hi..self.keys.len(),
            Cmp::Ge => lo..self.keys.len(),
            Cmp::Lt => 0..lo,
            Cmp::Le => 0..hi,
            Cmp::Eq => lo..hi,
            Cmp::Ne => 0..0,
        };
        hits.extend(
            self.keys[range]
                .iter()
                .filter(|(k, _)| k.comparable(p))
                .map(|&(_, i)| i),
        );
    }
}

impl JoinTable for MultiKeyTable {
    fn add(&mut self, keys: &[Scalar], bindings: Arc<[Scalar]>, ordinal: u64) {
        let idx = self.entries.len();
        let mut stored = false;
        for k in keys.iter().filter(|k| !k.is_null()) {
            stored = true;
            match self.cmp {
                Cmp::Eq => self
                    .buckets
                    .entry(hash_scalar(k))
                    .or_default()
                    .push((k.clone(), idx)),
                _ => {
                    self.keys.push((k.clone(), idx));
                    self.sorted = false;
                }
            }
        }
        if stored {
            self.entries.push(Entry { ordinal, bindings });
        }
    }

    fn finish(&mut self) {
        if !self.sorted {
            self.keys.sort_by(|a, b| a.0.compare(&b.0).then(a.1.cmp(&b.1)));
            self.sorted = true;
        }
    }

    fn probe(&self, keys: &[Scalar]) -> Vec<Arc<[Scalar]>> {
        let mut hits = Vec::new();
        for p in keys.iter().filter(|k| !k.is_null()) {
            match self.cmp {
                Cmp::Eq => {
                    if let Some(bucket) = self.buckets.get(&hash_scalar(p)) {
                        hits.extend(
                            bucket
                                .iter()
                                .filter(|(k, _)| self.cmp.holds(p.compare(k)))
                                .map(|&(_, i)| i),
                        );
                    }
                }
                Cmp::Ne => hits.extend(
                    self.keys
                        .iter()
                        .filter(|(k, _)| k.comparable(p) && self.cmp.holds(p.compare(k)))
                        .map(|&(_, i)| i),
                ),
                _ => self.collect_range(p, &mut hits),
            }
        }

        let mut seen = HashSet::with_capacity(hits.len());
        hits.retain(|i| seen.insert(*i));
        if !self.skip_sort {
            hits.sort_by_key(|&i| self.entries[i].ordinal);
        }
        hits.into_iter()
            .map(|i| Arc::clone(&self.entries[i].bindings))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
