//! # Interval Index
//!
//! Ordered index of non-overlapping, inclusive page ranges.
//!
//! Entries are keyed by their start page. Because live entries never
//! overlap, ordering by start also orders by end, so an overlap query only
//! has to look at the entry just before `lo` and the entries starting
//! inside `[lo, hi]`.
//!
//! Callers iterate with [`IntervalIndex::first_overlap`] followed by
//! [`IntervalIndex::next_overlap`] keyed on the previous start, which stays
//! valid while entries are removed or inserted behind the cursor.

use alloc::collections::BTreeMap;
use core::ops::Bound;

use magma_core::{Error, Result};

/// One indexed range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval<V> {
    /// First page
    pub start: u64,
    /// Last page, inclusive
    pub last: u64,
    /// Payload
    pub value: V,
}

/// Range-keyed index with logarithmic operations
#[derive(Debug, Clone)]
pub struct IntervalIndex<V> {
    nodes: BTreeMap<u64, (u64, V)>,
}

impl<V: Copy> IntervalIndex<V> {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if there are no entries
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert `[start, last]`
    ///
    /// Fails with [`Error::Conflict`] if the range overlaps an existing
    /// entry; the index is left unchanged.
    pub fn insert(&mut self, start: u64, last: u64, value: V) -> Result<()> {
        if start > last {
            return Err(Error::InvalidArgument);
        }
        if self.first_overlap(start, last).is_some() {
            return Err(Error::Conflict);
        }
        self.nodes.insert(start, (last, value));
        Ok(())
    }

    /// Remove the entry starting at `start`
    pub fn remove(&mut self, start: u64) -> Option<Interval<V>> {
        self.nodes
            .remove(&start)
            .map(|(last, value)| Interval { start, last, value })
    }

    /// Entry starting exactly at `start`
    pub fn get(&self, start: u64) -> Option<Interval<V>> {
        self.nodes
            .get(&start)
            .map(|&(last, value)| Interval { start, last, value })
    }

    /// Lowest entry intersecting `[lo, hi]`
    pub fn first_overlap(&self, lo: u64, hi: u64) -> Option<Interval<V>> {
        if lo > hi {
            return None;
        }

        if let Some((&start, &(last, value))) = self.nodes.range(..=lo).next_back() {
            if last >= lo {
                return Some(Interval { start, last, value });
            }
        }

        self.nodes
            .range((Bound::Excluded(lo), Bound::Included(hi)))
            .next()
            .map(|(&start, &(last, value))| Interval { start, last, value })
    }

    /// Next entry after the one starting at `after` that intersects `[lo, hi]`
    ///
    /// `after` need not be present any more.
    pub fn next_overlap(&self, after: u64, lo: u64, hi: u64) -> Option<Interval<V>> {
        if lo > hi || after >= hi {
            return None;
        }

        self.nodes
            .range((Bound::Excluded(after), Bound::Included(hi)))
            .map(|(&start, &(last, value))| Interval { start, last, value })
            .find(|iv| iv.last >= lo)
    }

    /// All entries intersecting `[lo, hi]`, in address order
    pub fn overlapping(&self, lo: u64, hi: u64) -> impl Iterator<Item = Interval<V>> + '_ {
        let mut next = self.first_overlap(lo, hi);
        core::iter::from_fn(move || {
            let cur = next?;
            next = self.next_overlap(cur.start, lo, hi);
            Some(cur)
        })
    }

    /// All entries in address order
    pub fn iter(&self) -> impl Iterator<Item = Interval<V>> + '_ {
        self.nodes
            .iter()
            .map(|(&start, &(last, value))| Interval { start, last, value })
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

impl<V: Copy> Default for IntervalIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}
