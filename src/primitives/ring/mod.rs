#![forbid(unsafe_code)]

//! FIFO log of populated chunks.
//!
//! The ring is owned by the worker thread and is never shared, so it carries
//! no internal locking.

use crate::types::{ObjectId, Result, UfoError};

/// A populated chunk: `size` bytes installed at `address` for `owner`.
///
/// A record with `size == 0` has been logically evicted (its owner was
/// destroyed first). It stays in the ring until popped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChunkRecord {
    /// First byte of the chunk.
    pub address: usize,
    /// Resident bytes; zero once retired.
    pub size: usize,
    /// Object the chunk belongs to.
    pub owner: ObjectId,
}

impl ChunkRecord {
    /// Returns true if the record still accounts for resident memory.
    pub fn is_live(&self) -> bool {
        self.size > 0
    }
}

/// Circular buffer of [`ChunkRecord`]s in population order.
#[derive(Debug)]
pub struct EvictionRing {
    slots: Box<[Option<ChunkRecord>]>,
    head: usize,
    len: usize,
}

impl EvictionRing {
    /// Creates an empty ring with room for `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    /// Records currently queued, live or retired.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no records are queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots available before the ring must grow.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Appends `record` as the newest entry.
    ///
    /// A full ring doubles its capacity when `allow_grow` is set and fails
    /// with [`UfoError::RingExhausted`] otherwise.
    pub fn push(&mut self, record: ChunkRecord, allow_grow: bool) -> Result<()> {
        if self.len == self.slots.len() {
            if !allow_grow {
                return Err(UfoError::RingExhausted);
            }
            self.grow();
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(record);
        self.len += 1;
        Ok(())
    }

    /// Removes and returns the oldest record.
    pub fn pop(&mut self) -> Result<ChunkRecord> {
        if self.len == 0 {
            return Err(UfoError::RingEmpty);
        }
        let record = self.slots[self.head]
            .take()
            .ok_or(UfoError::RingEmpty)?;
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        Ok(record)
    }

    /// Oldest-first iterator over all records, including logically evicted ones.
    pub fn iter(&self) -> impl Iterator<Item = &ChunkRecord> + '_ {
        let cap = self.slots.len();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % cap].as_ref())
    }

    /// Oldest-first mutable iterator over all records.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChunkRecord> + '_ {
        let (head, len) = (self.head, self.len);
        let (wrapped, front) = self.slots.split_at_mut(head);
        let first = front.len().min(len);
        let second = len - first;
        front[..first]
            .iter_mut()
            .chain(wrapped[..second].iter_mut())
            .filter_map(Option::as_mut)
    }

    /// Sum of sizes over live records.
    pub fn live_bytes(&self) -> usize {
        self.iter().map(|record| record.size).sum()
    }

    /// Zeroes every record owned by `owner` and returns the bytes they held.
    pub fn retire_owner(&mut self, owner: ObjectId) -> usize {
        let mut released = 0;
        for record in self.iter_mut().filter(|r| r.owner == owner) {
            released += record.size;
            record.size = 0;
        }
        released
    }

    fn grow(&mut self) {
        let new_cap = self.slots.len() * 2;
        let mut slots = vec![None; new_cap];
        let cap = self.slots.len();
        for (i, slot) in slots.iter_mut().take(self.len).enumerate() {
            *slot = self.slots[(self.head + i) % cap].take();
        }
        self.slots = slots.into_boxed_slice();
        self.head = 0;
    }
}
