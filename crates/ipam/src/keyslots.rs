//! Key-slots container
//!
//! A fixed `keys x slots_per_key` bitset matrix. Keys keep their insertion
//! order, and [`KeySlots::use_next_free`] always picks the first key (in that
//! order) that still has a free slot, then the lowest free slot index on it.

use crate::error::KeySlotsError;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

/// Bitset matrix of `slots_per_key` slots for each key.
#[derive(Debug, Clone)]
pub struct KeySlots<K> {
    slots_per_key: u32,
    keys: Vec<K>,
    index: HashMap<K, usize>,
    bits: Vec<Vec<u64>>,
    counts: Vec<u32>,
    free_keys: BTreeSet<usize>,
    used: u64,
}

impl<K: Eq + Hash + Clone> KeySlots<K> {
    /// Create an empty matrix. Duplicate keys are collapsed.
    pub fn new(keys: impl IntoIterator<Item = K>, slots_per_key: u32) -> Self {
        let words = slots_per_key.div_ceil(64) as usize;
        let mut slots = Self {
            slots_per_key,
            keys: Vec::new(),
            index: HashMap::new(),
            bits: Vec::new(),
            counts: Vec::new(),
            free_keys: BTreeSet::new(),
            used: 0,
        };
        for key in keys {
            if slots.index.contains_key(&key) {
                continue;
            }
            let idx = slots.keys.len();
            slots.index.insert(key.clone(), idx);
            slots.keys.push(key);
            slots.bits.push(vec![0; words]);
            slots.counts.push(0);
            if slots_per_key > 0 {
                slots.free_keys.insert(idx);
            }
        }
        slots
    }

    /// `|keys| * slots_per_key`
    pub fn total(&self) -> u64 {
        self.keys.len() as u64 * u64::from(self.slots_per_key)
    }

    /// Number of set slots
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Slots per key
    pub fn slots_per_key(&self) -> u32 {
        self.slots_per_key
    }

    /// Keys in insertion order
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Whether `key` is part of the matrix
    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Whether `slot` on `key` is set
    pub fn is_used(&self, key: &K, slot: u32) -> bool {
        match self.index.get(key) {
            Some(&idx) if slot < self.slots_per_key => {
                self.bits[idx][(slot / 64) as usize] & (1u64 << (slot % 64)) != 0
            }
            _ => false,
        }
    }

    fn locate(&self, key: &K, slot: u32) -> Result<usize, KeySlotsError> {
        let idx = *self.index.get(key).ok_or(KeySlotsError::UnknownKey)?;
        if slot >= self.slots_per_key {
            return Err(KeySlotsError::SlotOutOfRange {
                slot,
                slots_per_key: self.slots_per_key,
            });
        }
        Ok(idx)
    }

    fn set(&mut self, idx: usize, slot: u32) {
        self.bits[idx][(slot / 64) as usize] |= 1u64 << (slot % 64);
        self.counts[idx] += 1;
        self.used += 1;
        if self.counts[idx] == self.slots_per_key {
            self.free_keys.remove(&idx);
        }
    }

    /// Mark `slot` on `key` as used.
    pub fn use_slot(&mut self, key: &K, slot: u32) -> Result<(), KeySlotsError> {
        let idx = self.locate(key, slot)?;
        if self.is_used(key, slot) {
            return Err(KeySlotsError::SlotInUse(slot));
        }
        self.set(idx, slot);
        Ok(())
    }

    /// Mark `slot` on `key` as free again.
    pub fn release_slot(&mut self, key: &K, slot: u32) -> Result<(), KeySlotsError> {
        let idx = self.locate(key, slot)?;
        if !self.is_used(key, slot) {
            return Err(KeySlotsError::SlotNotInUse(slot));
        }
        self.bits[idx][(slot / 64) as usize] &= !(1u64 << (slot % 64));
        self.counts[idx] -= 1;
        self.used -= 1;
        self.free_keys.insert(idx);
        Ok(())
    }

    /// Take the lowest free slot on the first key that has one.
    pub fn use_next_free(&mut self) -> Option<(K, u32)> {
        let idx = *self.free_keys.iter().next()?;
        let slot = self.bits[idx].iter().enumerate().find_map(|(word_idx, word)| {
            (*word != u64::MAX).then(|| word_idx as u32 * 64 + word.trailing_ones())
        })?;
        if slot >= self.slots_per_key {
            return None;
        }
        self.set(idx, slot);
        Some((self.keys[idx].clone(), slot))
    }
}
