#![forbid(unsafe_code)]

//! Address-interval index mapping an address to the object that owns it.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::types::{Result, UfoError};

#[derive(Debug)]
struct Entry<V> {
    len: usize,
    value: V,
}

/// Disjoint `[start, start + len)` intervals keyed by start address.
///
/// Updates happen once per object lifecycle event, lookups once per fault,
/// so a `BTreeMap` predecessor query is enough.
#[derive(Debug)]
pub struct ObjectRegistry<V> {
    intervals: BTreeMap<usize, Entry<V>>,
}

impl<V> Default for ObjectRegistry<V> {
    fn default() -> Self {
        Self {
            intervals: BTreeMap::new(),
        }
    }
}

impl<V> ObjectRegistry<V> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Registers `[start, start + len)`.
    ///
    /// Fails with [`UfoError::Overlap`] if the interval intersects a
    /// registered one, and rejects empty intervals.
    pub fn insert(&mut self, start: usize, len: usize, value: V) -> Result<()> {
        if len == 0 {
            return Err(UfoError::InvalidConfig("empty address interval"));
        }
        let end = start
            .checked_add(len)
            .ok_or(UfoError::Overlap { start, len })?;
        if let Some((&prev_start, prev)) = self.intervals.range(..=start).next_back() {
            if prev_start + prev.len > start {
                return Err(UfoError::Overlap { start, len });
            }
        }
        if let Some((&next_start, _)) = self
            .intervals
            .range((Bound::Excluded(start), Bound::Unbounded))
            .next()
        {
            if next_start < end {
                return Err(UfoError::Overlap { start, len });
            }
        }
        self.intervals.insert(start, Entry { len, value });
        Ok(())
    }

    /// Returns the value whose interval contains `address`, for mutation.
    pub fn lookup_mut(&mut self, address: usize) -> Result<&mut V> {
        match self.intervals.range_mut(..=address).next_back() {
            Some((&start, entry)) if address - start < entry.len => Ok(&mut entry.value),
            _ => Err(UfoError::UnknownAddress(address)),
        }
    }

    /// Returns `(start, len, value)` for the interval containing `address`.
    pub fn find(&self, address: usize) -> Option<(usize, usize, &V)> {
        let (&start, entry) = self.intervals.range(..=address).next_back()?;
        (address - start < entry.len).then_some((start, entry.len, &entry.value))
    }

    /// Unregisters the interval that begins at `start` and returns its value.
    pub fn remove(&mut self, start: usize) -> Result<V> {
        self.intervals
            .remove(&start)
            .map(|entry| entry.value)
            .ok_or(UfoError::UnknownAddress(start))
    }

    /// Iterates `(start, len, value)` in address order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &V)> + '_ {
        self.intervals
            .iter()
            .map(|(&start, entry)| (start, entry.len, &entry.value))
    }

    /// Drops every interval.
    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    /// Removes every interval, yielding the values in address order.
    pub fn drain(&mut self) -> impl Iterator<Item = (usize, usize, V)> {
        std::mem::take(&mut self.intervals)
            .into_iter()
            .map(|(start, entry)| (start, entry.len, entry.value))
    }
}
