//! Shared Object Space (SOS)
//!
//! Objects every Maatine may reference: interned strings, functions,
//! classes, namespaces, channels and promoted immutable values. Shared
//! objects only ever reference other shared objects, so the space is
//! collected by a global pass instead of by any single heap:
//!
//! 1. [`SharedSpace::begin_pass`] opens a new mark epoch and marks the
//!    runtime roots (namespaces, builtin classes).
//! 2. Every participating Maatine reports the shared references its heap
//!    holds through [`SharedSpace::arrive`].
//! 3. Anybody may call [`SharedSpace::trace_step`]: gray entries are claimed
//!    through the pass token, an atomic cursor over the append-only gray
//!    list, so each object is traced exactly once per pass.
//! 4. [`SharedSpace::try_finish`] sweeps once all participants arrived and
//!    the gray list is exhausted.
//!
//! Objects created or handed out while a pass is open are marked for that
//! pass. Marking and tracing hold the pass lock shared; only the final sweep
//! takes it exclusively.

pub mod intern;

pub use intern::StringTable;

use crate::defaults::MAX_SHORT_LEN;
use crate::object::string::hash_str;
use crate::object::{
    ClassObj, ClosureObj, FunObj, NamespaceObj, ObjRef, RangeObj, StrObj, U8StrObj, SHARED_SPACE,
};
use crate::scheduler::Channel;
use crate::value::{variant, Kind, Tag, Value};
use crate::{MaatError, MaatResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Instrumentation hook called with every object a pass traces
pub type TraceHook = Arc<dyn Fn(ObjRef) + Send + Sync>;

/// Body of a shared object
#[derive(Debug)]
pub enum SharedBody {
    /// Interned short string or promoted long string
    Str(StrObj),
    /// UTF-8 string
    U8Str(U8StrObj),
    /// Range
    Range(RangeObj),
    /// Function
    Fun(FunObj),
    /// Closure without upvalues
    Closure(ClosureObj),
    /// Class or role
    Class(ClassObj),
    /// Namespace
    Ns(NamespaceObj),
    /// Channel
    Channel(Channel),
}

impl SharedBody {
    fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        match self {
            SharedBody::Str(_) | SharedBody::U8Str(_) | SharedBody::Range(_) => {}
            SharedBody::Fun(fun) => fun.constants.iter().for_each(|v| f(*v)),
            SharedBody::Closure(c) => c.for_each_ref(f),
            SharedBody::Class(c) => c.for_each_ref(f),
            SharedBody::Ns(ns) => ns.for_each_ref(f),
            SharedBody::Channel(ch) => ch.for_each_ref(f),
        }
    }
}

/// Object of the shared space
#[derive(Debug)]
pub struct SharedObject {
    /// Kind and variant
    pub tag: Tag,
    /// Owning class
    pub class: ObjRef,
    /// Epoch of the last pass that marked this object
    mark: AtomicU32,
    /// Body
    pub body: SharedBody,
}

impl SharedObject {
    /// Value referencing this object through `r`
    #[inline]
    pub fn value(&self, r: ObjRef) -> Value {
        Value::Obj(self.tag, r)
    }

    /// Kind of the object
    #[inline]
    pub fn kind(&self) -> Kind {
        self.tag.kind()
    }

    /// Whether the pass of `epoch` marked the object
    pub fn is_marked(&self, epoch: u32) -> bool {
        self.mark.load(Ordering::Acquire) == epoch
    }

    /// Visit every value the object references, its class included
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        f(Value::object(Kind::Class, 0, self.class));
        self.body.for_each_ref(f);
    }

    /// String body
    pub fn as_str(&self) -> Option<&StrObj> {
        match &self.body {
            SharedBody::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Function body
    pub fn as_fun(&self) -> Option<&FunObj> {
        match &self.body {
            SharedBody::Fun(f) => Some(f),
            _ => None,
        }
    }

    /// Class body
    pub fn as_class(&self) -> Option<&ClassObj> {
        match &self.body {
            SharedBody::Class(c) => Some(c),
            _ => None,
        }
    }

    /// Namespace body
    pub fn as_ns(&self) -> Option<&NamespaceObj> {
        match &self.body {
            SharedBody::Ns(ns) => Some(ns),
            _ => None,
        }
    }

    /// Channel body
    pub fn as_channel(&self) -> Option<&Channel> {
        match &self.body {
            SharedBody::Channel(ch) => Some(ch),
            _ => None,
        }
    }
}

struct SharedSlot {
    stamp: u32,
    obj: Option<Arc<SharedObject>>,
}

#[derive(Default)]
struct SlotTable {
    slots: Vec<SharedSlot>,
    free: Vec<u32>,
    live: usize,
}

/// Phase of the global pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    /// No pass open
    Idle,
    /// Participants are reporting and tracing
    Marking,
}

struct PassState {
    phase: PassPhase,
    epoch: u32,
    participants: usize,
}

/// Statistics of the shared space
#[derive(Debug, Clone, Default)]
pub struct SosStats {
    /// Completed passes
    pub passes: usize,
    /// Objects freed by all passes
    pub objects_freed: usize,
    /// Intern entries pruned by all passes
    pub strings_pruned: usize,
}

/// The shared object space
pub struct SharedSpace {
    /// Seed of the string hash
    seed: u64,

    /// Object slots; the write lock is only taken to insert or sweep
    slots: RwLock<SlotTable>,

    /// Interned short strings
    strings: StringTable,

    /// Pass state
    pass: RwLock<PassState>,

    /// Marked, not necessarily traced, objects of the open pass
    gray: RwLock<Vec<ObjRef>>,

    /// Pass token: index of the next untraced gray entry
    cursor: AtomicUsize,

    /// Participants that reported their roots
    arrived: AtomicUsize,

    /// Objects created since the last pass
    allocated: AtomicUsize,

    /// Allocations that trigger the next pass
    threshold: usize,

    /// Test instrumentation
    trace_hook: RwLock<Option<TraceHook>>,

    /// Statistics
    stats: RwLock<SosStats>,
}

impl SharedSpace {
    /// Empty space hashing strings with `seed`
    pub fn new(seed: u64, threshold: usize) -> Self {
        Self {
            seed,
            slots: RwLock::new(SlotTable::default()),
            strings: StringTable::new(),
            pass: RwLock::new(PassState {
                phase: PassPhase::Idle,
                epoch: 1,
                participants: 0,
            }),
            gray: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            arrived: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            threshold,
            trace_hook: RwLock::new(None),
            stats: RwLock::new(SosStats::default()),
        }
    }

    /// Seed of the string hash
    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Interned short strings
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// Insert an object
    pub fn insert(&self, tag: Tag, class: ObjRef, body: SharedBody) -> ObjRef {
        let pass = self.pass.read();
        self.insert_locked(&pass, tag, Some(class), body)
    }

    /// Insert an object that is its own class (the root `Class` class)
    pub(crate) fn insert_self_classed(&self, tag: Tag, body: SharedBody) -> ObjRef {
        let pass = self.pass.read();
        self.insert_locked(&pass, tag, None, body)
    }

    fn insert_locked(&self, pass: &PassState, tag: Tag, class: Option<ObjRef>, body: SharedBody) -> ObjRef {
        let mut table = self.slots.write();
        let slot = match table.free.pop() {
            Some(slot) => slot,
            None => {
                table.slots.push(SharedSlot { stamp: 0, obj: None });
                (table.slots.len() - 1) as u32
            }
        };
        let r = ObjRef::new(SHARED_SPACE, slot, table.slots[slot as usize].stamp);
        // new objects belong to the current epoch; during a pass that keeps
        // them alive without being traced, their children are all marked
        table.slots[slot as usize].obj = Some(Arc::new(SharedObject {
            tag,
            class: class.unwrap_or(r),
            mark: AtomicU32::new(pass.epoch),
            body,
        }));
        table.live += 1;
        drop(table);

        if pass.phase == PassPhase::Marking {
            self.gray.write().push(r);
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        r
    }

    /// Shared object behind `r`
    ///
    /// Panics on a stale handle: a shared reference outlived every report
    /// of the pass that freed it.
    pub fn get(&self, r: ObjRef) -> Arc<SharedObject> {
        match self.try_get(r) {
            Some(obj) => obj,
            None => panic!("internal error: {:?} is not a live shared object", r),
        }
    }

    /// Shared object behind `r`, if alive
    pub fn try_get(&self, r: ObjRef) -> Option<Arc<SharedObject>> {
        if !r.is_shared() {
            return None;
        }
        let table = self.slots.read();
        let slot = table.slots.get(r.slot() as usize)?;
        if slot.stamp != r.stamp() {
            return None;
        }
        slot.obj.clone()
    }

    /// Whether `r` is a live shared object
    pub fn contains(&self, r: ObjRef) -> bool {
        self.try_get(r).is_some()
    }

    /// Number of live shared objects
    pub fn len(&self) -> usize {
        self.slots.read().live
    }

    /// Whether the space is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live shared objects of `kind`
    pub fn count_kind(&self, kind: Kind) -> usize {
        self.slots
            .read()
            .slots
            .iter()
            .filter_map(|s| s.obj.as_ref())
            .filter(|o| o.kind() == kind)
            .count()
    }

    /// Intern a short string, or store a long one
    ///
    /// Interning is idempotent: the same content always yields the same
    /// reference while it is reachable.
    pub fn intern(&self, class: ObjRef, s: &str) -> Value {
        let pass = self.pass.read();
        if s.len() > MAX_SHORT_LEN {
            let body = SharedBody::Str(StrObj::long(Arc::from(s)));
            let tag = Tag::make(Kind::Str, variant::STR_LONG);
            return Value::Obj(tag, self.insert_locked(&pass, tag, Some(class), body));
        }

        let hash = hash_str(self.seed, s);
        let tag = Tag::make(Kind::Str, variant::STR_SHORT);
        let (r, created) = self.strings.get_or_insert_with(hash, s, |content| {
            let body = SharedBody::Str(StrObj::short(content, hash));
            self.insert_locked(&pass, tag, Some(class), body)
        });
        if !created {
            self.mark_locked(&pass, r);
        }
        Value::Obj(tag, r)
    }

    /// Epoch of the open pass
    pub fn pass_epoch(&self) -> Option<u32> {
        let pass = self.pass.read();
        (pass.phase == PassPhase::Marking).then_some(pass.epoch)
    }

    /// Whether enough shared objects were created to start a pass
    pub fn should_collect(&self) -> bool {
        self.allocated.load(Ordering::Relaxed) > self.threshold
    }

    /// Statistics
    pub fn stats(&self) -> SosStats {
        self.stats.read().clone()
    }

    /// Install an instrumentation hook called for every traced object
    pub fn set_trace_hook(&self, hook: Option<TraceHook>) {
        *self.trace_hook.write() = hook;
    }

    /// Mark `value` for the open pass, if any
    ///
    /// Called on every shared reference a Maatine obtains from a mutable
    /// shared object, and on values overwritten in one.
    pub fn mark_value(&self, value: Value) {
        if let Some(r) = value.obj_ref() {
            let pass = self.pass.read();
            self.mark_locked(&pass, r);
        }
    }

    fn mark_locked(&self, pass: &PassState, r: ObjRef) {
        if pass.phase != PassPhase::Marking || !r.is_shared() {
            return;
        }
        let Some(obj) = self.try_get(r) else {
            return;
        };
        if obj.mark.swap(pass.epoch, Ordering::AcqRel) != pass.epoch {
            self.gray.write().push(r);
        }
    }

    /// Open a pass for `participants` Maatines, marking `roots`
    ///
    /// Returns the new epoch, or `None` when a pass is already open.
    pub fn begin_pass(&self, participants: usize, roots: &[ObjRef]) -> Option<u32> {
        let mut pass = self.pass.write();
        if pass.phase != PassPhase::Idle {
            return None;
        }
        pass.epoch = pass.epoch.wrapping_add(1).max(1);
        pass.phase = PassPhase::Marking;
        pass.participants = participants;
        self.gray.write().clear();
        self.cursor.store(0, Ordering::Release);
        self.arrived.store(0, Ordering::Release);
        self.allocated.store(0, Ordering::Relaxed);
        for r in roots {
            self.mark_locked(&pass, *r);
        }
        debug!(target: "maat::sos", epoch = pass.epoch, participants, "shared pass started");
        Some(pass.epoch)
    }

    /// Report the shared references one participant holds
    pub fn arrive(&self, epoch: u32, refs: impl IntoIterator<Item = Value>) {
        let pass = self.pass.read();
        if pass.phase != PassPhase::Marking || pass.epoch != epoch {
            return;
        }
        for v in refs {
            if let Some(r) = v.obj_ref() {
                self.mark_locked(&pass, r);
            }
        }
        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(target: "maat::sos", epoch, arrived, participants = pass.participants, "participant arrived");
    }

    // Claim the next untraced gray entry.
    fn claim(&self) -> Option<ObjRef> {
        let gray = self.gray.read();
        let mut cursor = self.cursor.load(Ordering::Acquire);
        loop {
            if cursor >= gray.len() {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                cursor,
                cursor + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(gray[cursor]),
                Err(actual) => cursor = actual,
            }
        }
    }

    /// Trace up to `budget` gray objects
    ///
    /// Returns true when no claimable work is left right now.
    pub fn trace_step(&self, budget: usize) -> bool {
        let pass = self.pass.read();
        if pass.phase != PassPhase::Marking {
            return true;
        }
        let hook = self.trace_hook.read().clone();
        for _ in 0..budget {
            let Some(r) = self.claim() else {
                return true;
            };
            let Some(obj) = self.try_get(r) else {
                continue;
            };
            if let Some(hook) = &hook {
                hook(r);
            }
            obj.for_each_ref(|v| {
                if let Some(child) = v.obj_ref() {
                    self.mark_locked(&pass, child);
                }
            });
        }
        self.cursor.load(Ordering::Acquire) >= self.gray.read().len()
    }

    /// Sweep if every participant arrived and all marked objects are traced
    ///
    /// Returns true when this call completed the pass.
    pub fn try_finish(&self) -> bool {
        if !self.ready_to_finish(&self.pass.read()) {
            return false;
        }
        let mut pass = self.pass.write();
        if !self.ready_to_finish(&pass) {
            return false;
        }
        self.sweep_locked(&mut pass);
        true
    }

    fn ready_to_finish(&self, pass: &PassState) -> bool {
        pass.phase == PassPhase::Marking
            && self.arrived.load(Ordering::Acquire) >= pass.participants
            && self.cursor.load(Ordering::Acquire) >= self.gray.read().len()
    }

    fn sweep_locked(&self, pass: &mut PassState) {
        let epoch = pass.epoch;
        let pruned = self.strings.retain(|r| {
            self.try_get(r).is_some_and(|obj| obj.is_marked(epoch))
        });

        let mut freed = 0;
        let mut table = self.slots.write();
        let SlotTable { slots, free, live } = &mut *table;
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.obj.as_ref().is_some_and(|obj| !obj.is_marked(epoch)) {
                slot.obj = None;
                slot.stamp = slot.stamp.wrapping_add(1);
                free.push(i as u32);
                *live -= 1;
                freed += 1;
            }
        }
        let live = *live;
        drop(table);

        pass.phase = PassPhase::Idle;
        self.gray.write().clear();
        self.cursor.store(0, Ordering::Release);
        {
            let mut stats = self.stats.write();
            stats.passes += 1;
            stats.objects_freed += freed;
            stats.strings_pruned += pruned;
        }
        debug!(target: "maat::sos", epoch, freed, pruned, live, "shared pass finished");
    }

    /// Global named `symbol` in namespace `ns`
    pub fn ns_get(&self, ns: ObjRef, symbol: &str) -> MaatResult<Value> {
        let obj = self.get(ns);
        let namespace = obj.as_ns().ok_or(MaatError::TypeError {
            expected: Kind::Ns,
            found: obj.kind(),
        })?;
        let value = namespace.get(symbol);
        self.mark_value(value);
        Ok(value)
    }

    /// Bind `symbol` in namespace `ns`
    ///
    /// `value` must already be shareable. The overwritten binding is marked
    /// when a pass is open so no participant loses track of it.
    pub fn ns_set(&self, ns: ObjRef, symbol: &str, value: Value) -> MaatResult<()> {
        if value.is_collectable() && !value.is_shared() {
            return Err(MaatError::NotShareable(value.kind()));
        }
        let obj = self.get(ns);
        let namespace = obj.as_ns().ok_or(MaatError::TypeError {
            expected: Kind::Ns,
            found: obj.kind(),
        })?;
        if let Some(old) = namespace.set(symbol, value) {
            self.mark_value(old);
        }
        self.mark_value(value);
        Ok(())
    }

    /// Remove `symbol` from namespace `ns`
    pub fn ns_remove(&self, ns: ObjRef, symbol: &str) -> MaatResult<Option<Value>> {
        let obj = self.get(ns);
        let namespace = obj.as_ns().ok_or(MaatError::TypeError {
            expected: Kind::Ns,
            found: obj.kind(),
        })?;
        let old = namespace.remove(symbol);
        if let Some(old) = old {
            self.mark_value(old);
        }
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn class_root(sos: &SharedSpace) -> ObjRef {
        let body = SharedBody::Range(RangeObj { from: 0.0, to: 0.0 });
        sos.insert_self_classed(Tag::make(Kind::Range, 0), body)
    }

    #[test]
    fn test_intern_is_idempotent() {
        let sos = SharedSpace::new(42, 1000);
        let class = class_root(&sos);
        let a = sos.intern(class, "hello");
        let b = sos.intern(class, "hello");
        let c = sos.intern(class, "world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.variant(), variant::STR_SHORT);
        assert_eq!(sos.strings().len(), 2);
    }

    #[test]
    fn test_long_strings_are_not_interned() {
        let sos = SharedSpace::new(42, 1000);
        let class = class_root(&sos);
        let long = "x".repeat(MAX_SHORT_LEN + 1);
        let a = sos.intern(class, &long);
        let b = sos.intern(class, &long);
        assert_ne!(a, b);
        assert_eq!(a.variant(), variant::STR_LONG);
        let obj = sos.get(a.as_str());
        assert!(!obj.as_str().unwrap().is_hashed());
    }

    #[test]
    fn test_pass_frees_unreachable() {
        let sos = SharedSpace::new(1, 1000);
        let class = class_root(&sos);
        let kept = sos.intern(class, "kept");
        let lost = sos.intern(class, "lost");

        let epoch = sos.begin_pass(1, &[class]).unwrap();
        assert!(sos.begin_pass(1, &[]).is_none());
        sos.arrive(epoch, [kept]);
        assert!(!sos.try_finish());
        while !sos.trace_step(4) {}
        assert!(sos.try_finish());

        assert!(sos.contains(kept.as_str()));
        assert!(!sos.contains(lost.as_str()));
        assert_eq!(sos.strings().len(), 1);
        assert_eq!(sos.stats().passes, 1);

        // a fresh intern of the pruned content creates a new object
        let again = sos.intern(class, "lost");
        assert_ne!(again, lost);
    }

    #[test]
    fn test_pass_waits_for_participants() {
        let sos = SharedSpace::new(1, 1000);
        let epoch = sos.begin_pass(2, &[]).unwrap();
        sos.arrive(epoch, []);
        sos.trace_step(usize::MAX);
        assert!(!sos.try_finish());
        sos.arrive(epoch, []);
        assert!(sos.try_finish());
    }

    #[test]
    fn test_overwritten_binding_survives_open_pass() {
        let sos = SharedSpace::new(1, 1000);
        let class = class_root(&sos);
        let ns = sos.insert(
            Tag::make(Kind::Ns, 0),
            class,
            SharedBody::Ns(NamespaceObj::new(Arc::from("main"), 0)),
        );
        let first = sos.intern(class, "first");
        sos.ns_set(ns, "x", first).unwrap();

        let epoch = sos.begin_pass(1, &[ns, class]).unwrap();
        // overwrite before the namespace is traced
        let second = sos.intern(class, "second");
        sos.ns_set(ns, "x", second).unwrap();
        sos.arrive(epoch, []);
        while !sos.trace_step(1) {}
        assert!(sos.try_finish());
        assert!(sos.contains(first.as_str()));
        assert!(sos.contains(second.as_str()));
    }

    #[test]
    fn test_trace_hook_sees_each_object_once() {
        let sos = SharedSpace::new(1, 1000);
        let class = class_root(&sos);
        let strings: Vec<Value> = (0..20).map(|i| sos.intern(class, &format!("s{}", i))).collect();

        let seen: Arc<Mutex<HashMap<ObjRef, usize>>> = Arc::default();
        let sink = seen.clone();
        let hook: TraceHook = Arc::new(move |r: ObjRef| {
            *sink.lock().unwrap().entry(r).or_default() += 1;
        });
        sos.set_trace_hook(Some(hook));
        let epoch = sos.begin_pass(1, &[class]).unwrap();
        sos.arrive(epoch, strings.iter().copied());
        while !sos.trace_step(3) {}
        assert!(sos.try_finish());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 21);
        assert!(seen.values().all(|n| *n == 1));
    }

    #[test]
    fn test_ns_rejects_heap_values() {
        let sos = SharedSpace::new(1, 1000);
        let class = class_root(&sos);
        let ns = sos.insert(
            Tag::make(Kind::Ns, 0),
            class,
            SharedBody::Ns(NamespaceObj::new(Arc::from("main"), 0)),
        );
        let local = Value::object(Kind::Array, 0, ObjRef::new(5, 0, 0));
        assert!(matches!(
            sos.ns_set(ns, "x", local),
            Err(MaatError::NotShareable(Kind::Array))
        ));
        sos.ns_set(ns, "n", Value::Num(3.0)).unwrap();
        assert_eq!(sos.ns_get(ns, "n").unwrap(), Value::Num(3.0));
        assert!(sos.ns_get(ns, "missing").unwrap().is_abskey());
    }
}
