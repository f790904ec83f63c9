//! Arrays and maps
//!
//! A map keeps small non-negative integer keys in a dense array part and all
//! other keys in a chained hash part. Deleted array slots hold the free-slot
//! nil; lookups of absent keys return the absent-key nil rather than failing.
//!
//! Keys are passed in resolved form ([`MapKey`]) because string keys compare
//! by contents, which only the owning Maatine can read.

use crate::defaults::MAX_ARRAY_PART;
use crate::object::string::hash_str;
use crate::object::ObjRef;
use crate::value::{variant, Num, Value};
use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::sync::Arc;

/// Array or list object
#[derive(Debug, Default)]
pub struct ArrayObj {
    items: Vec<Value>,
    list: bool,
}

impl ArrayObj {
    /// Empty array (`list == false`) or list
    pub fn new(list: bool) -> Self {
        Self { items: Vec::new(), list }
    }

    /// Array holding `items`
    pub fn from_vec(items: Vec<Value>, list: bool) -> Self {
        Self { items, list }
    }

    /// Tag variant
    pub fn variant(&self) -> u8 {
        if self.list {
            variant::LIST
        } else {
            variant::ARRAY
        }
    }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the array is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Element at `index`
    #[inline]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.get(index).copied()
    }

    /// Overwrite the element at `index`; returns false when out of bounds
    pub fn set(&mut self, index: usize, value: Value) -> bool {
        match self.items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Append an element
    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }

    /// Remove the last element
    pub fn pop(&mut self) -> Option<Value> {
        self.items.pop()
    }

    /// Iterate over the elements
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }
}

/// A map key with string contents resolved
#[derive(Debug, Clone, Copy)]
pub enum MapKey<'a> {
    /// Boolean key
    Bool(bool),
    /// Number key (never NaN)
    Num(Num),
    /// String key, compared by contents
    Str(&'a Arc<str>),
    /// Any other object, compared by identity
    Obj(ObjRef),
    /// Native function or data, compared by address
    Ptr(usize),
}

impl MapKey<'_> {
    fn array_index(&self) -> Option<usize> {
        match *self {
            MapKey::Num(n) if n >= 0.0 && n.fract() == 0.0 && (n as usize) < MAX_ARRAY_PART => {
                Some(n as usize)
            }
            _ => None,
        }
    }

    fn hash(&self, seed: u64) -> u64 {
        let mut hasher = FxHasher::default();
        match *self {
            MapKey::Str(s) => return hash_str(seed, s),
            MapKey::Bool(b) => {
                hasher.write_u8(1);
                hasher.write_u8(b as u8);
            }
            MapKey::Num(n) => {
                hasher.write_u8(2);
                hasher.write_u64(num_bits(n));
            }
            MapKey::Obj(r) => {
                hasher.write_u8(3);
                hasher.write_u32(r.space());
                hasher.write_u32(r.slot());
                hasher.write_u32(r.stamp());
            }
            MapKey::Ptr(p) => {
                hasher.write_u8(4);
                hasher.write_usize(p);
            }
        }
        hasher.finish()
    }

    fn into_owned(self) -> OwnedKey {
        match self {
            MapKey::Bool(b) => OwnedKey::Bool(b),
            MapKey::Num(n) => OwnedKey::Num(num_bits(n)),
            MapKey::Str(s) => OwnedKey::Str(Arc::clone(s)),
            MapKey::Obj(r) => OwnedKey::Obj(r),
            MapKey::Ptr(p) => OwnedKey::Ptr(p),
        }
    }
}

fn num_bits(n: Num) -> u64 {
    // 0.0 and -0.0 are the same key
    if n == 0.0 {
        0
    } else {
        n.to_bits() as u64
    }
}

#[derive(Debug, Clone)]
enum OwnedKey {
    Bool(bool),
    Num(u64),
    Str(Arc<str>),
    Obj(ObjRef),
    Ptr(usize),
}

impl OwnedKey {
    fn matches(&self, key: &MapKey<'_>) -> bool {
        match (self, key) {
            (OwnedKey::Bool(a), MapKey::Bool(b)) => a == b,
            (OwnedKey::Num(a), MapKey::Num(b)) => *a == num_bits(*b),
            (OwnedKey::Str(a), MapKey::Str(b)) => a.as_ref() == b.as_ref(),
            (OwnedKey::Obj(a), MapKey::Obj(b)) => a == b,
            (OwnedKey::Ptr(a), MapKey::Ptr(b)) => a == b,
            _ => false,
        }
    }

    fn as_key(&self) -> MapKey<'_> {
        match self {
            OwnedKey::Bool(b) => MapKey::Bool(*b),
            OwnedKey::Num(bits) => MapKey::Num(Num::from_bits(*bits as _)),
            OwnedKey::Str(s) => MapKey::Str(s),
            OwnedKey::Obj(r) => MapKey::Obj(*r),
            OwnedKey::Ptr(p) => MapKey::Ptr(*p),
        }
    }
}

#[derive(Debug)]
struct Node {
    key: OwnedKey,
    key_value: Value,
    hash: u64,
    value: Value,
    next: Option<u32>,
}

/// Location of an entry found by [`MapObj::find`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapSlot {
    /// Index into the array part
    Array(usize),
    /// Node of the hash part
    Node(u32),
}

/// Map object
#[derive(Debug, Default)]
pub struct MapObj {
    array: Vec<Value>,
    array_count: usize,
    buckets: Vec<Option<u32>>,
    nodes: Vec<Node>,
    free_nodes: Vec<u32>,
    hash_count: usize,
}

impl MapObj {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.array_count + self.hash_count
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the array part, holes included
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Approximate bytes owned by the map
    pub fn size_hint(&self) -> usize {
        self.array.capacity() * std::mem::size_of::<Value>()
            + self.buckets.capacity() * std::mem::size_of::<Option<u32>>()
            + self.nodes.capacity() * std::mem::size_of::<Node>()
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Locate `key`
    pub fn find(&self, key: &MapKey<'_>, seed: u64) -> Option<MapSlot> {
        if let Some(index) = key.array_index() {
            if index < self.array.len() {
                return (!self.array[index].is_free()).then_some(MapSlot::Array(index));
            }
        }
        self.find_in_hash(key, seed)
    }

    /// Value stored at a slot returned by [`MapObj::find`]
    pub fn value_at(&self, slot: MapSlot) -> Value {
        match slot {
            MapSlot::Array(i) => self.array[i],
            MapSlot::Node(id) => self.nodes[id as usize].value,
        }
    }

    /// Overwrite the value at a slot returned by [`MapObj::find`]
    pub fn set_at(&mut self, slot: MapSlot, value: Value) {
        match slot {
            MapSlot::Array(i) => self.array[i] = value,
            MapSlot::Node(id) => self.nodes[id as usize].value = value,
        }
    }

    /// Value for `key`, or the absent-key nil
    pub fn get(&self, key: &MapKey<'_>, seed: u64) -> Value {
        match self.find(key, seed) {
            Some(slot) => self.value_at(slot),
            None => Value::ABSKEY,
        }
    }

    /// Insert or overwrite; returns the previous value
    pub fn insert(&mut self, key: MapKey<'_>, key_value: Value, value: Value, seed: u64) -> Option<Value> {
        if let Some(slot) = self.find(&key, seed) {
            let old = self.value_at(slot);
            self.set_at(slot, value);
            return Some(old);
        }

        if let Some(index) = key.array_index() {
            if index < self.array.len() {
                self.array[index] = value;
                self.array_count += 1;
                return None;
            }
            if index == self.array.len() {
                self.array.push(value);
                self.array_count += 1;
                self.migrate_to_array(seed);
                return None;
            }
        }

        self.insert_node(key, key_value, value, seed);
        None
    }

    /// Remove `key`; returns the removed value
    pub fn remove(&mut self, key: &MapKey<'_>, seed: u64) -> Option<Value> {
        match self.find(key, seed)? {
            MapSlot::Array(i) => {
                let old = std::mem::replace(&mut self.array[i], Value::FREE);
                self.array_count -= 1;
                while self.array.last().is_some_and(Value::is_free) {
                    self.array.pop();
                }
                Some(old)
            }
            MapSlot::Node(id) => Some(self.unlink_node(id)),
        }
    }

    /// Visit every live entry; array keys are reported as numbers
    pub fn for_each_entry(&self, mut f: impl FnMut(Value, Value)) {
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_free() {
                f(Value::Num(i as Num), *v);
            }
        }
        for node in &self.nodes {
            if !node.value.is_free() {
                f(node.key_value, node.value);
            }
        }
    }

    /// Snapshot of the live entries
    pub fn entries(&self) -> Vec<(Value, Value)> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each_entry(|k, v| out.push((k, v)));
        out
    }

    fn insert_node(&mut self, key: MapKey<'_>, key_value: Value, value: Value, seed: u64) {
        if self.hash_count + 1 > self.buckets.len() * 3 / 4 {
            self.rehash((self.buckets.len() * 2).max(8));
        }
        let hash = key.hash(seed);
        let bucket = self.bucket_of(hash);
        let node = Node {
            key: key.into_owned(),
            key_value,
            hash,
            value,
            next: self.buckets[bucket],
        };
        let id = match self.free_nodes.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        };
        self.buckets[bucket] = Some(id);
        self.hash_count += 1;
    }

    fn rehash(&mut self, size: usize) {
        self.buckets = vec![None; size];
        for id in 0..self.nodes.len() {
            if self.nodes[id].value.is_free() {
                continue;
            }
            let bucket = self.bucket_of(self.nodes[id].hash);
            self.nodes[id].next = self.buckets[bucket];
            self.buckets[bucket] = Some(id as u32);
        }
    }

    // Pull keys len, len+1, ... out of the hash part after the array grew.
    fn migrate_to_array(&mut self, seed: u64) {
        while self.hash_count > 0 {
            let key = MapKey::Num(self.array.len() as Num);
            let Some(MapSlot::Node(id)) = self.find_in_hash(&key, seed) else {
                break;
            };
            let value = self.unlink_node(id);
            self.array.push(value);
            self.array_count += 1;
        }
    }

    fn find_in_hash(&self, key: &MapKey<'_>, seed: u64) -> Option<MapSlot> {
        if self.buckets.is_empty() {
            return None;
        }
        let hash = key.hash(seed);
        let mut cursor = self.buckets[self.bucket_of(hash)];
        while let Some(id) = cursor {
            let node = &self.nodes[id as usize];
            if node.hash == hash && node.key.matches(key) {
                return Some(MapSlot::Node(id));
            }
            cursor = node.next;
        }
        None
    }

    fn unlink_node(&mut self, id: u32) -> Value {
        let bucket = self.bucket_of(self.nodes[id as usize].hash);
        let next = self.nodes[id as usize].next;
        if self.buckets[bucket] == Some(id) {
            self.buckets[bucket] = next;
        } else {
            let mut cursor = self.buckets[bucket];
            while let Some(prev) = cursor {
                if self.nodes[prev as usize].next == Some(id) {
                    self.nodes[prev as usize].next = next;
                    break;
                }
                cursor = self.nodes[prev as usize].next;
            }
        }
        let node = &mut self.nodes[id as usize];
        node.next = None;
        node.key_value = Value::FREE;
        let old = std::mem::replace(&mut node.value, Value::FREE);
        self.free_nodes.push(id);
        self.hash_count -= 1;
        old
    }

    /// Keys of the hash part, mostly for diagnostics
    pub fn hash_keys(&self) -> impl Iterator<Item = MapKey<'_>> {
        self.nodes
            .iter()
            .filter(|n| !n.value.is_free())
            .map(|n| n.key.as_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: u64 = 0x5eed;

    fn num(n: Num) -> (MapKey<'static>, Value) {
        (MapKey::Num(n), Value::Num(n))
    }

    #[test]
    fn test_array_part_for_dense_keys() {
        let mut map = MapObj::new();
        for i in 0..10 {
            let (k, kv) = num(i as Num);
            map.insert(k, kv, Value::Num(i as Num * 2.0), SEED);
        }
        assert_eq!(map.array_len(), 10);
        assert_eq!(map.len(), 10);
        assert_eq!(map.get(&MapKey::Num(3.0), SEED), Value::Num(6.0));
    }

    #[test]
    fn test_sparse_keys_migrate_into_array() {
        let mut map = MapObj::new();
        let (k2, v2) = num(2.0);
        map.insert(k2, v2, Value::Bool(true), SEED);
        assert_eq!(map.array_len(), 0);

        let (k0, v0) = num(0.0);
        let (k1, v1) = num(1.0);
        map.insert(k0, v0, Value::NIL, SEED);
        map.insert(k1, v1, Value::NIL, SEED);
        assert_eq!(map.array_len(), 3);
        assert_eq!(map.hash_keys().count(), 0);
        assert_eq!(map.get(&MapKey::Num(2.0), SEED), Value::Bool(true));
    }

    #[test]
    fn test_string_keys_compare_by_content() {
        let mut map = MapObj::new();
        let a: Arc<str> = Arc::from("name");
        let b: Arc<str> = Arc::from("name");
        map.insert(MapKey::Str(&a), Value::NIL, Value::Num(1.0), SEED);
        assert_eq!(map.get(&MapKey::Str(&b), SEED), Value::Num(1.0));
        assert!(map.get(&MapKey::Str(&Arc::from("other")), SEED).is_abskey());
    }

    #[test]
    fn test_remove_and_reuse_nodes() {
        let mut map = MapObj::new();
        for i in 0..50 {
            map.insert(MapKey::Num(-(i as Num) - 1.0), Value::NIL, Value::Num(i as Num), SEED);
        }
        for i in 0..50 {
            assert_eq!(map.remove(&MapKey::Num(-(i as Num) - 1.0), SEED), Some(Value::Num(i as Num)));
        }
        assert!(map.is_empty());
        assert!(map.get(&MapKey::Num(-1.0), SEED).is_abskey());

        map.insert(MapKey::Bool(true), Value::Bool(true), Value::Num(9.0), SEED);
        assert_eq!(map.len(), 1);
        assert_eq!(map.entries(), vec![(Value::Bool(true), Value::Num(9.0))]);
    }

    #[test]
    fn test_array_hole_is_free_marker() {
        let mut map = MapObj::new();
        for i in 0..3 {
            let (k, kv) = num(i as Num);
            map.insert(k, kv, Value::Num(1.0), SEED);
        }
        map.remove(&MapKey::Num(1.0), SEED);
        assert_eq!(map.array_len(), 3);
        assert!(map.get(&MapKey::Num(1.0), SEED).is_abskey());
        map.remove(&MapKey::Num(2.0), SEED);
        assert_eq!(map.array_len(), 1);
    }

    #[test]
    fn test_zero_keys_are_equal() {
        let mut map = MapObj::new();
        map.insert(MapKey::Num(-0.5), Value::NIL, Value::Num(1.0), SEED);
        map.insert(MapKey::Num(0.0), Value::Num(0.0), Value::Num(2.0), SEED);
        assert_eq!(map.get(&MapKey::Num(-0.0), SEED), Value::Num(2.0));
    }
}
