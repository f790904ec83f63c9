//! Short string interning
//!
//! Fixed number of buckets selected by the seeded content hash, each behind
//! its own `RwLock`. Lookups of different buckets never contend and hits
//! only take a read lock; a miss upgrades to the bucket's write lock and
//! checks again before inserting, so two Maatines interning the same
//! content at once still end up with one object.

use crate::defaults::INTERN_BUCKETS;
use crate::object::ObjRef;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Entry {
    hash: u64,
    content: Arc<str>,
    r: ObjRef,
}

/// Interned short strings of the shared object space
pub struct StringTable {
    buckets: Box<[RwLock<Vec<Entry>>]>,
    count: AtomicUsize,
}

impl StringTable {
    /// Empty table
    pub fn new() -> Self {
        Self {
            buckets: (0..INTERN_BUCKETS).map(|_| RwLock::new(Vec::new())).collect(),
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn bucket(&self, hash: u64) -> &RwLock<Vec<Entry>> {
        &self.buckets[(hash % self.buckets.len() as u64) as usize]
    }

    /// Interned object for `content`
    pub fn lookup(&self, hash: u64, content: &str) -> Option<ObjRef> {
        self.bucket(hash)
            .read()
            .iter()
            .find(|e| e.hash == hash && e.content.as_ref() == content)
            .map(|e| e.r)
    }

    /// Interned object for `content`, creating it with `create` on a miss
    ///
    /// Returns the reference and whether it was created by this call.
    pub(crate) fn get_or_insert_with(
        &self,
        hash: u64,
        content: &str,
        create: impl FnOnce(Arc<str>) -> ObjRef,
    ) -> (ObjRef, bool) {
        if let Some(r) = self.lookup(hash, content) {
            return (r, false);
        }
        let mut bucket = self.bucket(hash).write();
        if let Some(e) = bucket
            .iter()
            .find(|e| e.hash == hash && e.content.as_ref() == content)
        {
            return (e.r, false);
        }
        let content: Arc<str> = Arc::from(content);
        let r = create(content.clone());
        bucket.push(Entry { hash, content, r });
        self.count.fetch_add(1, Ordering::Relaxed);
        (r, true)
    }

    /// Drop every entry for which `keep` returns false; returns how many
    pub(crate) fn retain(&self, mut keep: impl FnMut(ObjRef) -> bool) -> usize {
        let mut removed = 0;
        for bucket in self.buckets.iter() {
            let mut bucket = bucket.write();
            let before = bucket.len();
            bucket.retain(|e| keep(e.r));
            removed += before - bucket.len();
        }
        self.count.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether nothing is interned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::string::hash_str;
    use crate::object::SHARED_SPACE;

    #[test]
    fn test_hit_does_not_create() {
        let table = StringTable::new();
        let mut next = 0;
        let mut intern = |s: &str| {
            table.get_or_insert_with(hash_str(7, s), s, |_| {
                next += 1;
                ObjRef::new(SHARED_SPACE, next, 0)
            })
        };
        let (a, created_a) = intern("hello");
        let (b, created_b) = intern("hello");
        let (c, _) = intern("world");
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_retain_prunes() {
        let table = StringTable::new();
        for (i, s) in ["a", "b", "c"].iter().enumerate() {
            table.get_or_insert_with(hash_str(0, s), s, |_| ObjRef::new(SHARED_SPACE, i as u32, 0));
        }
        assert_eq!(table.retain(|r| r.slot() != 1), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(hash_str(0, "b"), "b"), None);
    }
}
