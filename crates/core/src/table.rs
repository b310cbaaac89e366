//! Open-addressed hash table keyed by interned strings.
//!
//! Collision resolution is linear probing with tombstones; capacity is
//! always a power of two so the probe sequence is `(hash + i) & mask`.
//! A deleted slot becomes a tombstone (`key = None, value = true`) that
//! probes traverse but insertions may reuse. Growth at 75% load rehashes
//! every live entry and drops the tombstones.
//!
//! Entries cache their key's hash so rehashing and identity lookups never
//! need to touch the heap; callers pass the hash alongside the key.

use crate::object::ObjRef;
use crate::value::Value;

const MIN_CAPACITY: usize = 8;

/// FNV-1a, 32 bits. The hash every interned string carries.
pub fn hash_str(text: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in text.as_bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        hash: 0,
        value: Value::Nil,
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

/// Hash map from interned string to [`Value`], also used as a set by the
/// intern table itself (value unused).
#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries; excludes tombstones.
    live: usize,
    /// Live entries plus tombstones; drives the growth decision.
    used: usize,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[find_entry(&self.entries, key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Insert or overwrite. Returns `true` when the key was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.used + 1) * 4 > self.entries.len() * 3 {
            self.grow();
        }
        let index = find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new {
            if !entry.is_tombstone() {
                self.used += 1;
            }
            self.live += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Remove a key, leaving a tombstone. Returns `true` if it was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry {
            key: None,
            hash: 0,
            value: Value::Bool(true),
        };
        self.live -= 1;
        true
    }

    /// Content-based probe used by the intern-first protocol: walk the
    /// probe sequence for `hash` and return the first key whose cached
    /// hash matches and for which `eq` confirms byte equality.
    pub fn find_string(&self, hash: u32, mut eq: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(key) => {
                    if entry.hash == hash && eq(key) {
                        return Some(key);
                    }
                }
                // A truly empty slot ends the probe; tombstones do not.
                None if !entry.is_tombstone() => return None,
                None => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// All live `(key, value)` pairs, in table order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// All live `(key, hash)` pairs; what a weak sweep needs to delete by.
    pub fn keys(&self) -> impl Iterator<Item = (ObjRef, u32)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.hash)))
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() {
            MIN_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_capacity]);
        self.live = 0;
        self.used = 0;
        for entry in old {
            if entry.key.is_some() {
                let index = find_entry(&self.entries, entry.key.expect("checked"), entry.hash);
                self.entries[index] = entry;
                self.live += 1;
                self.used += 1;
            }
        }
    }
}

/// Locate the slot for `key`: its current slot if present, otherwise the
/// first reusable slot (preferring the earliest tombstone passed over).
fn find_entry(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
    let mask = entries.len() - 1;
    let mut index = hash as usize & mask;
    let mut tombstone: Option<usize> = None;
    loop {
        let entry = &entries[index];
        match entry.key {
            Some(existing) if existing == key => return index,
            Some(_) => {}
            None if entry.is_tombstone() => {
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
            None => return tombstone.unwrap_or(index),
        }
        index = (index + 1) & mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Heap;

    fn key(heap: &mut Heap, text: &str) -> (ObjRef, u32) {
        let handle = heap.intern(text);
        (handle, heap.string_hash(handle))
    }

    #[test]
    fn test_set_get_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (k, h) = key(&mut heap, "answer");

        assert!(table.set(k, h, Value::Number(1.0)));
        assert_eq!(table.get(k, h), Some(Value::Number(1.0)));

        assert!(!table.set(k, h, Value::Number(2.0)));
        assert_eq!(table.get(k, h), Some(Value::Number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_leaves_reusable_tombstone() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (a, ha) = key(&mut heap, "a");
        let (b, hb) = key(&mut heap, "b");

        table.set(a, ha, Value::Bool(true));
        table.set(b, hb, Value::Bool(true));
        assert!(table.delete(a, ha));
        assert!(!table.delete(a, ha));
        assert_eq!(table.get(a, ha), None);
        // b must still be reachable past a's tombstone
        assert_eq!(table.get(b, hb), Some(Value::Bool(true)));

        // re-insert reuses the slot without growing load
        table.set(a, ha, Value::Nil);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_growth_preserves_entries_and_drops_tombstones() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let mut keys = Vec::new();
        for i in 0..64 {
            let (k, h) = key(&mut heap, &format!("key{i}"));
            table.set(k, h, Value::Number(i as f64));
            keys.push((k, h));
        }
        for (i, (k, h)) in keys.iter().enumerate() {
            if i % 3 == 0 {
                table.delete(*k, *h);
            }
        }
        for (i, (k, h)) in keys.iter().enumerate() {
            let expected = if i % 3 == 0 {
                None
            } else {
                Some(Value::Number(i as f64))
            };
            assert_eq!(table.get(*k, *h), expected, "key{i}");
        }
    }

    #[test]
    fn test_load_matches_reachable_keys() {
        // load == number of keys reachable via get, after any mix of ops
        let mut heap = Heap::new();
        let mut table = Table::new();
        let mut keys = Vec::new();
        for i in 0..40 {
            let (k, h) = key(&mut heap, &format!("k{i}"));
            keys.push((k, h));
            table.set(k, h, Value::Number(i as f64));
        }
        for (i, (k, h)) in keys.iter().enumerate() {
            if i % 2 == 0 {
                table.delete(*k, *h);
            }
        }
        for (i, (k, h)) in keys.iter().enumerate() {
            if i % 4 == 0 {
                table.set(*k, *h, Value::Nil);
            }
        }
        let reachable = keys
            .iter()
            .filter(|(k, h)| table.get(*k, *h).is_some())
            .count();
        assert_eq!(table.len(), reachable);
    }

    #[test]
    fn test_find_string_stops_at_empty() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (k, h) = key(&mut heap, "needle");
        table.set(k, h, Value::Nil);

        let text = heap.string_text(k).to_string();
        let found = table.find_string(h, |candidate| heap.string_text(candidate) == text);
        assert_eq!(found, Some(k));
        assert_eq!(table.find_string(h ^ 1, |_| true), None);
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(hash_str(""), 2166136261);
        assert_eq!(hash_str("a"), 0xe40c292c);
        assert_eq!(hash_str("foobar"), 0xbf9cf968);
    }
}
