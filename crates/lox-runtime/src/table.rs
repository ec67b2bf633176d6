//! Open-addressed hash table keyed by interned strings.
//!
//! Used for the global environment, instance fields, class method tables,
//! and the string intern table itself. Keys are `StrRef`s, so key equality is
//! a reference comparison; the key's FNV-1a hash is precomputed at interning
//! time and passed in by the caller (and cached per entry so the table can
//! grow and copy itself without consulting the heap).
//!
//! Deletion leaves tombstones: probe sequences skip them on lookup but may
//! reuse them on insert. Tombstones count against the load factor so that a
//! table cycling through insert/delete still grows.

use crate::heap::Marker;
use crate::object::StrRef;
use crate::value::Value;

/// Grow when (live + tombstones) exceeds three quarters of capacity.
const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Entry {
    Empty,
    Tombstone,
    Pair {
        key: StrRef,
        hash: u32,
        value: Value,
    },
}

/// String-keyed map with open addressing and linear probing.
#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live pairs plus tombstones; governs growth.
    count: usize,
    /// Live pairs only.
    live: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Backing storage footprint, for heap byte accounting.
    pub fn capacity_bytes(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    /// Looks up `key`, whose interning-time hash is `hash`.
    pub fn get(&self, key: StrRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match self.entries[self.find_slot(key, hash)] {
            Entry::Pair { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Inserts or overwrites. Returns true when the key was not present.
    pub fn set(&mut self, key: StrRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DENOMINATOR > self.entries.len() * MAX_LOAD_NUMERATOR {
            self.grow();
        }

        let slot = self.find_slot(key, hash);
        let is_new = match self.entries[slot] {
            Entry::Empty => {
                // Fresh slot; tombstone reuse does not bump the load count.
                self.count += 1;
                true
            }
            Entry::Tombstone => true,
            Entry::Pair { .. } => false,
        };
        if is_new {
            self.live += 1;
        }
        self.entries[slot] = Entry::Pair { key, hash, value };
        is_new
    }

    /// Removes `key`, leaving a tombstone. Returns true if it was present.
    pub fn delete(&mut self, key: StrRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = self.find_slot(key, hash);
        match self.entries[slot] {
            Entry::Pair { .. } => {
                self.entries[slot] = Entry::Tombstone;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Iterates live `(key, value)` pairs in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (StrRef, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Pair { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Iterates live `(key, hash, value)` triples; lets one table be copied
    /// into another without re-deriving hashes.
    pub fn iter_with_hash(&self) -> impl Iterator<Item = (StrRef, u32, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Pair { key, hash, value } => Some((*key, *hash, *value)),
            _ => None,
        })
    }

    /// Content-based lookup for string interning: finds the key whose
    /// characters equal `needle`. `resolve` maps a key to its characters.
    pub fn find_string<'a>(
        &self,
        needle: &str,
        hash: u32,
        resolve: impl Fn(StrRef) -> &'a str,
    ) -> Option<StrRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            match self.entries[index] {
                Entry::Empty => return None,
                Entry::Tombstone => {}
                Entry::Pair {
                    key,
                    hash: entry_hash,
                    ..
                } => {
                    if entry_hash == hash && resolve(key) == needle {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Drops every entry whose key fails the predicate. The intern table is
    /// weak: the collector purges unmarked keys here before sweeping.
    pub fn retain_keys(&mut self, keep: impl Fn(StrRef) -> bool) {
        for entry in &mut self.entries {
            if let Entry::Pair { key, .. } = *entry {
                if !keep(key) {
                    *entry = Entry::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    /// Marks all keys and values as GC roots or reachable children.
    pub fn trace(&self, marker: &mut Marker<'_>) {
        for (key, value) in self.iter() {
            marker.mark_str(key);
            marker.mark_value(value);
        }
    }

    /// Probes for `key`, returning the slot holding it, or the slot where it
    /// would be inserted (the first tombstone seen, else the empty slot that
    /// ended the probe).
    fn find_slot(&self, key: StrRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Pair { key: existing, .. } => {
                    if existing == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Doubles capacity and re-inserts live entries, dropping tombstones.
    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::Empty; new_capacity]);
        self.count = 0;
        self.live = 0;
        for entry in old {
            if let Entry::Pair { key, hash, value } = entry {
                self.set(key, hash, value);
            }
        }
    }
}
