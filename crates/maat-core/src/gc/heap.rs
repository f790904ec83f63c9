//! Per-Maatine object arena
//!
//! Objects live in a slab of slots addressed by [`ObjRef`]. Freed slots go
//! on a free list and get their stamp bumped, so handles to a freed object
//! are caught on access. Generation membership is kept in explicit slot
//! lists instead of intrusive links: sweeping walks those lists directly.

use crate::object::{Color, Header, HeapObject, Mark, ObjBody, ObjRef};
use crate::value::{Kind, Tag};
use rustc_hash::{FxHashMap, FxHashSet};

/// Finalizer run on an object right before its slot is reclaimed
pub type Finalizer = Box<dyn FnOnce(&HeapObject) + Send>;

/// Generation list an object can reside on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Has not survived a minor collection yet
    Nursery,
    /// Survived at least one minor collection, not promoted yet
    Survivor,
    /// Old generation
    Old,
}

struct Slot {
    stamp: u32,
    obj: Option<HeapObject>,
}

/// Object arena of one Maatine
pub struct Heap {
    /// Space id (the owning Maatine's id)
    space: u32,

    /// Arena slots
    slots: Vec<Slot>,

    /// Reusable slot indices
    free: Vec<u32>,

    /// Newest allocations
    pub(crate) nursery: Vec<u32>,

    /// Survivors of minor collections
    pub(crate) nursery2: Vec<u32>,

    /// Old generation
    pub(crate) old: Vec<u32>,

    /// Survivor target of a major sweep
    pub(crate) old2: Vec<u32>,

    /// Slots of live State objects
    pub(crate) states: FxHashSet<u32>,

    /// Registered finalizers
    finalizers: FxHashMap<u32, Finalizer>,

    /// Finalizable young objects
    pub(crate) fin_young: Vec<u32>,

    /// Finalizable old objects
    pub(crate) fin_old: Vec<u32>,

    /// Total bytes accounted to live objects
    allocated_bytes: usize,

    /// Bytes of old-generation objects
    pub(crate) old_bytes: usize,

    /// Live object count
    object_count: usize,
}

impl Heap {
    /// Create an empty heap for space `space`
    pub fn new(space: u32) -> Self {
        Self {
            space,
            slots: Vec::new(),
            free: Vec::new(),
            nursery: Vec::new(),
            nursery2: Vec::new(),
            old: Vec::new(),
            old2: Vec::new(),
            states: FxHashSet::default(),
            finalizers: FxHashMap::default(),
            fin_young: Vec::new(),
            fin_old: Vec::new(),
            allocated_bytes: 0,
            old_bytes: 0,
            object_count: 0,
        }
    }

    /// Space id of this heap
    #[inline]
    pub fn space(&self) -> u32 {
        self.space
    }

    /// Whether `r` points into this heap
    #[inline]
    pub fn owns(&self, r: ObjRef) -> bool {
        r.space() == self.space
    }

    /// Place a new object in the nursery
    pub(crate) fn insert(&mut self, tag: Tag, class: ObjRef, body: ObjBody, color: Color) -> ObjRef {
        let size = body.size_hint();
        let mut mark = Mark::default();
        mark.set_color(color);
        let is_state = tag.kind() == Kind::State;
        let obj = HeapObject {
            header: Header {
                tag,
                mark,
                class,
                size,
                finalizable: false,
            },
            body,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].obj = Some(obj);
                slot
            }
            None => {
                self.slots.push(Slot { stamp: 0, obj: Some(obj) });
                (self.slots.len() - 1) as u32
            }
        };

        self.nursery.push(slot);
        if is_state {
            self.states.insert(slot);
        }
        self.allocated_bytes += size;
        self.object_count += 1;
        ObjRef::new(self.space, slot, self.slots[slot as usize].stamp)
    }

    /// Release a slot, running its finalizer first
    pub(crate) fn free(&mut self, slot: u32) -> usize {
        if let Some(finalizer) = self.finalizers.remove(&slot) {
            if let Some(obj) = self.slots[slot as usize].obj.as_ref() {
                finalizer(obj);
            }
        }
        let entry = &mut self.slots[slot as usize];
        let Some(obj) = entry.obj.take() else {
            return 0;
        };
        entry.stamp = entry.stamp.wrapping_add(1);
        self.free.push(slot);
        self.states.remove(&slot);
        self.allocated_bytes -= obj.header.size;
        if obj.header.mark.is_old() {
            self.old_bytes -= obj.header.size;
        }
        self.object_count -= 1;
        obj.header.size
    }

    /// Object behind `r`
    ///
    /// Panics when `r` belongs to another space or was freed: both mean a
    /// reference escaped the collector's view.
    #[inline]
    pub fn get(&self, r: ObjRef) -> &HeapObject {
        match self.try_get(r) {
            Some(obj) => obj,
            None => stale_handle(self.space, r),
        }
    }

    /// Object behind `r`, mutable
    #[inline]
    pub fn get_mut(&mut self, r: ObjRef) -> &mut HeapObject {
        let space = self.space;
        match self.try_get_mut(r) {
            Some(obj) => obj,
            None => stale_handle(space, r),
        }
    }

    /// Object behind `r`, if it is alive in this heap
    pub fn try_get(&self, r: ObjRef) -> Option<&HeapObject> {
        if r.space() != self.space {
            return None;
        }
        let slot = self.slots.get(r.slot() as usize)?;
        if slot.stamp != r.stamp() {
            return None;
        }
        slot.obj.as_ref()
    }

    /// Object behind `r`, mutable, if it is alive in this heap
    pub fn try_get_mut(&mut self, r: ObjRef) -> Option<&mut HeapObject> {
        if r.space() != self.space {
            return None;
        }
        let slot = self.slots.get_mut(r.slot() as usize)?;
        if slot.stamp != r.stamp() {
            return None;
        }
        slot.obj.as_mut()
    }

    /// Whether `r` is a live object of this heap
    pub fn contains(&self, r: ObjRef) -> bool {
        self.try_get(r).is_some()
    }

    #[inline]
    pub(crate) fn slot(&self, slot: u32) -> Option<&HeapObject> {
        self.slots.get(slot as usize).and_then(|s| s.obj.as_ref())
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, slot: u32) -> Option<&mut HeapObject> {
        self.slots.get_mut(slot as usize).and_then(|s| s.obj.as_mut())
    }

    /// Handle for a live slot
    pub(crate) fn handle(&self, slot: u32) -> ObjRef {
        ObjRef::new(self.space, slot, self.slots[slot as usize].stamp)
    }

    /// Account for an object that grew or shrank
    pub(crate) fn resize(&mut self, r: ObjRef, new_size: usize) {
        let obj = self.get_mut(r);
        let old_size = std::mem::replace(&mut obj.header.size, new_size);
        let is_old = obj.header.mark.is_old();
        self.allocated_bytes = self.allocated_bytes + new_size - old_size;
        if is_old {
            self.old_bytes = self.old_bytes + new_size - old_size;
        }
    }

    /// Register a finalizer for `r`
    pub fn set_finalizer(&mut self, r: ObjRef, finalizer: Finalizer) {
        let obj = self.get_mut(r);
        let first = !obj.header.finalizable;
        obj.header.finalizable = true;
        let old = obj.header.mark.is_old();
        self.finalizers.insert(r.slot(), finalizer);
        if first {
            if old {
                self.fin_old.push(r.slot());
            } else {
                self.fin_young.push(r.slot());
            }
        }
    }

    /// Live objects with their handles
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &HeapObject)> + '_ {
        self.slots.iter().enumerate().filter_map(move |(i, s)| {
            s.obj
                .as_ref()
                .map(|obj| (ObjRef::new(self.space, i as u32, s.stamp), obj))
        })
    }

    /// Generation of `r`, read from its mark
    pub fn generation_of(&self, r: ObjRef) -> Option<Generation> {
        let mark = self.try_get(r)?.header.mark;
        Some(if mark.is_old() {
            Generation::Old
        } else if mark.age() > 0 {
            Generation::Survivor
        } else {
            Generation::Nursery
        })
    }

    /// Handles on a generation list
    pub fn list(&self, generation: Generation) -> Vec<ObjRef> {
        let slots: Box<dyn Iterator<Item = &u32>> = match generation {
            Generation::Nursery => Box::new(self.nursery.iter()),
            Generation::Survivor => Box::new(self.nursery2.iter()),
            Generation::Old => Box::new(self.old.iter().chain(self.old2.iter())),
        };
        slots.map(|s| self.handle(*s)).collect()
    }

    /// Total bytes accounted to live objects
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Bytes of old-generation objects
    pub fn old_bytes(&self) -> usize {
        self.old_bytes
    }

    /// Live object count
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Live objects of `kind`
    pub fn count_kind(&self, kind: Kind) -> usize {
        self.iter().filter(|(_, obj)| obj.kind() == kind).count()
    }
}

#[cold]
#[inline(never)]
fn stale_handle(space: u32, r: ObjRef) -> ! {
    panic!("internal error: {:?} is not a live object of heap {}", r, space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ArrayObj, RangeObj, SHARED_SPACE};

    fn class() -> ObjRef {
        ObjRef::new(SHARED_SPACE, 0, 0)
    }

    fn range(heap: &mut Heap) -> ObjRef {
        let body = ObjBody::Range(RangeObj { from: 0.0, to: 1.0 });
        heap.insert(body.default_tag(), class(), body, Color::White)
    }

    #[test]
    fn test_insert_and_free() {
        let mut heap = Heap::new(3);
        let r = range(&mut heap);
        assert_eq!(r.space(), 3);
        assert!(heap.contains(r));
        assert_eq!(heap.generation_of(r), Some(Generation::Nursery));
        assert_eq!(heap.object_count(), 1);

        let bytes = heap.allocated_bytes();
        assert_eq!(heap.free(r.slot()), bytes);
        assert!(!heap.contains(r));
        assert_eq!(heap.allocated_bytes(), 0);
    }

    #[test]
    fn test_generation_follows_mark() {
        let mut heap = Heap::new(1);
        let r = range(&mut heap);
        heap.get_mut(r).header.mark.bump_age();
        assert_eq!(heap.generation_of(r), Some(Generation::Survivor));
        heap.get_mut(r).header.mark.set_old();
        assert_eq!(heap.generation_of(r), Some(Generation::Old));

        let gone = range(&mut heap);
        heap.free(gone.slot());
        assert_eq!(heap.generation_of(gone), None);
    }

    #[test]
    fn test_slot_reuse_bumps_stamp() {
        let mut heap = Heap::new(1);
        let a = range(&mut heap);
        heap.free(a.slot());
        heap.nursery.clear();
        let b = range(&mut heap);
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a.stamp(), b.stamp());
        assert!(heap.try_get(a).is_none());
    }

    #[test]
    #[should_panic(expected = "is not a live object")]
    fn test_foreign_handle_panics() {
        let heap = Heap::new(1);
        heap.get(ObjRef::new(2, 0, 0));
    }

    #[test]
    fn test_finalizer_runs_on_free() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut heap = Heap::new(1);
        let body = ObjBody::Array(ArrayObj::new(false));
        let r = heap.insert(body.default_tag(), class(), body, Color::White);
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        heap.set_finalizer(
            r,
            Box::new(move |obj| {
                assert_eq!(obj.kind(), Kind::Array);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(heap.fin_young, vec![r.slot()]);
        heap.free(r.slot());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
