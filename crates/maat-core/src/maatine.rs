//! Maatines: VM-level threads
//!
//! A Maatine owns one heap, a primary State plus any number of coroutine
//! States, a ready queue of Works and a stack of temporary roots. It is
//! driven by exactly one OS thread at a time; the scheduler moves it
//! between threads only between slices. Objects of a Maatine's heap are
//! never visible to another Maatine: anything that crosses over is promoted
//! into the shared object space first.
//!
//! Every store of a reference into a heap object goes through this type,
//! which applies the collector's write barrier.

use crate::defaults::{MAX_CALL_DEPTH, MAX_SHORT_LEN, SOS_TRACE_BUDGET};
use crate::dispatch::{Dispatch, Exit};
use crate::gc::{GarbageCollector, Heap, RootSet, TempMark, TempRoots};
use crate::object::{
    ArrayObj, ClosureObj, HeapObject, InstanceObj, MaObj, MapKey, MapObj, ObjBody, ObjRef,
    OpaqueObj, RangeObj, StrObj, U8StrObj, UpvalObj,
};
use crate::runtime::Runtime;
use crate::scheduler::RingQueue;
use crate::sos::SharedBody;
use crate::state::{BackRef, CallFrame, CoStatus, StateObj};
use crate::value::{variant, Kind, Num, Value};
use crate::{MaatError, MaatResult};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Maatine identifier; doubles as the space id of its heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaatineId(u32);

impl MaatineId {
    fn next() -> Self {
        MaatineId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Id from its raw number
    pub const fn from_raw(raw: u32) -> Self {
        MaatineId(raw)
    }

    /// Raw number
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MaatineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ma{}", self.0)
    }
}

/// Scheduling status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaatineStatus {
    /// Has queued Works and waits for a worker
    Ready,
    /// Executing on a worker
    Running,
    /// Waiting on a channel; polled again later
    Blocked,
    /// Nothing queued
    Idle,
    /// Terminated
    Dead,
}

/// How a scheduler slice ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// The ready queue drained
    Idle,
    /// Budget exhausted with Works still queued
    Yielded,
    /// A Work is waiting on a channel
    Blocked,
    /// The Maatine died; see [`Maatine::take_errors`]
    Terminated,
}

/// How a resumed coroutine gave control back
///
/// The values sit on top of the resumer's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoResult {
    /// Suspended with this many yielded values
    Yielded(usize),
    /// Finished with this many return values
    Returned(usize),
}

// Map key with string contents owned
enum ResolvedKey {
    Plain(MapKey<'static>),
    Str(Arc<str>),
}

impl ResolvedKey {
    fn key(&self) -> MapKey<'_> {
        match self {
            ResolvedKey::Plain(k) => *k,
            ResolvedKey::Str(s) => MapKey::Str(s),
        }
    }
}

fn collect_roots(
    primary: ObjRef,
    current: ObjRef,
    temps: &TempRoots,
    ready: &RingQueue<ObjRef>,
    running: &[ObjRef],
) -> RootSet {
    let mut roots = RootSet::new();
    roots.add_state_root(Value::object(Kind::State, 0, primary));
    roots.add_state_root(Value::object(Kind::State, 0, current));
    for v in temps.iter() {
        roots.add_root(v);
    }
    ready.for_each(|w| roots.add_root(Value::object(Kind::Work, 0, *w)));
    for w in running {
        roots.add_root(Value::object(Kind::Work, 0, *w));
    }
    roots
}

#[cold]
#[inline(never)]
fn body_mismatch(expected: Kind, found: &ObjBody) -> ! {
    panic!("internal error: expected {} body, found {:?}", expected, found.default_tag())
}

/// A VM thread
pub struct Maatine {
    id: MaatineId,
    runtime: Arc<Runtime>,
    pub(crate) gc: GarbageCollector,
    primary: ObjRef,
    pub(crate) current: ObjRef,
    temps: TempRoots,
    pub(crate) ready: RingQueue<ObjRef>,
    pub(crate) running: Vec<ObjRef>,
    status: MaatineStatus,
    reported_epoch: u32,
    errors: Vec<MaatError>,
}

impl Maatine {
    /// Create a Maatine and register it with `runtime`
    pub fn new(runtime: Arc<Runtime>) -> MaatResult<Self> {
        let id = MaatineId::next();
        let mut gc = GarbageCollector::new(id.as_u32(), runtime.options().gc.clone());
        let class = runtime.classes().for_kind(Kind::State);
        let primary = gc.allocate(ObjBody::State(StateObj::primary(id)), class, RootSet::new)?;
        let ready = RingQueue::new(runtime.options().scheduler.ready_capacity);
        runtime.register_maatine(id);
        trace!(target: "maat::sched", maatine = %id, "maatine created");
        Ok(Self {
            id,
            runtime,
            gc,
            primary,
            current: primary,
            temps: TempRoots::new(),
            ready,
            running: Vec::new(),
            status: MaatineStatus::Idle,
            reported_epoch: 0,
            errors: Vec::new(),
        })
    }

    /// Identifier
    #[inline]
    pub fn id(&self) -> MaatineId {
        self.id
    }

    /// Runtime this Maatine belongs to
    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The collector of this Maatine's heap
    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    /// The heap
    pub fn heap(&self) -> &Heap {
        self.gc.heap()
    }

    /// Scheduling status
    pub fn status(&self) -> MaatineStatus {
        self.status
    }

    /// Primary State
    pub fn primary(&self) -> Value {
        Value::object(Kind::State, variant::STATE_PRIMARY, self.primary)
    }

    /// State currently executing
    pub fn current(&self) -> Value {
        let variant = self.state_ref(self.current).variant();
        Value::object(Kind::State, variant, self.current)
    }

    /// Works waiting on the ready queue
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Roots of this Maatine's heap
    pub fn root_set(&self) -> RootSet {
        collect_roots(self.primary, self.current, &self.temps, &self.ready, &self.running)
    }

    // ---- safe points ------------------------------------------------------

    /// Give the collectors a chance to run
    ///
    /// Advances the heap's incremental cycle by one bounded step and takes
    /// part in an open shared pass.
    pub fn safe_point(&mut self) {
        if self.gc.wants_step() {
            let roots = self.root_set();
            self.gc.step(&roots);
        }
        self.poll_shared_pass();
    }

    /// Report to and help an open shared pass, starting one when due
    pub fn poll_shared_pass(&mut self) {
        let runtime = Arc::clone(&self.runtime);
        let sos = runtime.sos();
        if sos.pass_epoch().is_none() && sos.should_collect() {
            runtime.try_begin_shared_pass();
        }
        let Some(epoch) = sos.pass_epoch() else {
            return;
        };
        if self.reported_epoch != epoch {
            self.reported_epoch = epoch;
            if runtime.claim_arrival(self.id, epoch) {
                sos.arrive(epoch, self.shared_refs());
            }
        }
        sos.trace_step(SOS_TRACE_BUDGET);
        sos.try_finish();
    }

    // Every shared reference held by the heap or the roots.
    fn shared_refs(&self) -> Vec<Value> {
        let mut refs: Vec<Value> = self.root_set().iter().filter(Value::is_shared).collect();
        for (_, obj) in self.gc.heap().iter() {
            obj.for_each_ref(|v| {
                if v.is_shared() {
                    refs.push(v);
                }
            });
        }
        refs
    }

    /// Advance the collector by one incremental step now, starting a cycle
    /// if none is running
    ///
    /// Returns true when the step finished a cycle.
    pub fn gc_step(&mut self) -> bool {
        let roots = self.root_set();
        self.gc.force_step(&roots)
    }

    /// Run a complete minor collection now
    pub fn collect_minor(&mut self) {
        let roots = self.root_set();
        self.gc.collect_minor(&roots);
    }

    /// Run a complete major collection now
    pub fn full_collect(&mut self) {
        let roots = self.root_set();
        self.gc.full_collect(&roots);
    }

    // ---- allocation -------------------------------------------------------

    fn alloc_with_class(&mut self, body: ObjBody, class: ObjRef) -> MaatResult<Value> {
        let tag = body.default_tag();
        let Self {
            gc,
            primary,
            current,
            temps,
            ready,
            running,
            ..
        } = self;
        let (primary, current) = (*primary, *current);
        match gc.allocate(body, class, || collect_roots(primary, current, temps, ready, running)) {
            Ok(r) => Ok(Value::Obj(tag, r)),
            Err(e) => {
                if e.is_fatal() {
                    self.status = MaatineStatus::Dead;
                }
                Err(e)
            }
        }
    }

    /// Allocate `body` under its builtin class
    pub fn alloc(&mut self, body: ObjBody) -> MaatResult<Value> {
        let class = self.runtime.classes().for_kind(body.default_tag().kind());
        self.alloc_with_class(body, class)
    }

    /// String value: short strings are interned, long ones live in the heap
    pub fn new_str(&mut self, s: &str) -> MaatResult<Value> {
        if s.len() <= MAX_SHORT_LEN {
            return Ok(self.runtime.intern(s));
        }
        self.alloc(ObjBody::Str(StrObj::long(Arc::from(s))))
    }

    /// UTF-8 string
    pub fn new_u8str(&mut self, s: &str) -> MaatResult<Value> {
        self.alloc(ObjBody::U8Str(U8StrObj::new(Arc::from(s))))
    }

    /// Inclusive range
    pub fn new_range(&mut self, from: Num, to: Num) -> MaatResult<Value> {
        self.alloc(ObjBody::Range(RangeObj { from, to }))
    }

    /// Empty array (or list)
    pub fn new_array(&mut self, list: bool) -> MaatResult<Value> {
        self.alloc(ObjBody::Array(ArrayObj::new(list)))
    }

    /// Array holding `items`
    pub fn new_array_from(&mut self, items: Vec<Value>, list: bool) -> MaatResult<Value> {
        self.alloc(ObjBody::Array(ArrayObj::from_vec(items, list)))
    }

    /// Empty map
    pub fn new_map(&mut self) -> MaatResult<Value> {
        self.alloc(ObjBody::Map(MapObj::new()))
    }

    /// Instance of `class` holding the attribute defaults
    pub fn new_instance(&mut self, class: Value) -> MaatResult<Value> {
        let r = class.try_class()?;
        let obj = self.runtime.shared(class)?;
        let class_obj = obj.as_class().ok_or(MaatError::TypeError {
            expected: Kind::Class,
            found: obj.kind(),
        })?;
        self.alloc_with_class(ObjBody::Instance(InstanceObj::new(class_obj)), r)
    }

    /// Closure over the shared function `fun`
    pub fn new_closure(&mut self, fun: Value, upvals: Vec<ObjRef>) -> MaatResult<Value> {
        let r = fun.try_fun()?;
        if fun.variant() != variant::FUN || !r.is_shared() {
            return Err(MaatError::NotCallable(fun.kind()));
        }
        self.alloc(ObjBody::Closure(ClosureObj { fun: r, upvals }))
    }

    /// Coroutine (or generator) that runs `body` when first resumed
    pub fn new_coroutine(&mut self, body: Value, generator: bool) -> MaatResult<Value> {
        if !matches!(body.kind(), Kind::Fun | Kind::CFunc) {
            return Err(MaatError::NotCallable(body.kind()));
        }
        self.alloc(ObjBody::State(StateObj::coroutine(self.id, body, generator)))
    }

    /// Language-level handle to a Maatine
    pub fn new_ma_proxy(&mut self, id: MaatineId) -> MaatResult<Value> {
        self.alloc(ObjBody::Ma(MaObj { id }))
    }

    /// Opaque library object of kind `kind` (term, regex or io)
    pub fn new_opaque(&mut self, kind: Kind, data: Box<dyn Any + Send>) -> MaatResult<Value> {
        if !matches!(kind, Kind::Term | Kind::Regex | Kind::Io) {
            return Err(MaatError::TypeError { expected: Kind::Io, found: kind });
        }
        self.alloc(ObjBody::Opaque(OpaqueObj { kind, data }))
    }

    /// Register a finalizer run before the object behind `value` is freed
    pub fn set_finalizer(
        &mut self,
        value: Value,
        finalizer: impl FnOnce(&HeapObject) + Send + 'static,
    ) -> MaatResult<()> {
        let r = self.owned_any(value)?;
        self.gc.heap_mut().set_finalizer(r, Box::new(finalizer));
        Ok(())
    }

    // ---- temporary roots --------------------------------------------------

    /// Keep `value` alive until the returned mark is released
    pub fn protect(&mut self, value: Value) -> TempMark {
        self.temps.push(value)
    }

    /// Release every value protected since `mark`
    pub fn release(&mut self, mark: TempMark) {
        self.temps.truncate(mark);
    }

    /// Run `f` with `values` protected
    pub fn with_protected<R>(&mut self, values: &[Value], f: impl FnOnce(&mut Self) -> R) -> R {
        let mark = self.temps.mark();
        for v in values {
            self.temps.push(*v);
        }
        let result = f(self);
        self.temps.truncate(mark);
        result
    }

    // ---- object access ----------------------------------------------------

    fn owned(&self, value: Value, kind: Kind) -> MaatResult<ObjRef> {
        let r = value.try_obj(kind)?;
        if !self.gc.heap().owns(r) {
            return Err(MaatError::CrossMaatine);
        }
        Ok(r)
    }

    fn owned_any(&self, value: Value) -> MaatResult<ObjRef> {
        match value.obj_ref() {
            Some(r) if self.gc.heap().owns(r) => Ok(r),
            Some(_) => Err(MaatError::CrossMaatine),
            None => Err(MaatError::TypeError { expected: Kind::Instance, found: value.kind() }),
        }
    }

    /// Heap object behind `value`
    pub fn object(&self, value: Value) -> MaatResult<&HeapObject> {
        let r = self.owned_any(value)?;
        Ok(self.gc.heap().get(r))
    }

    fn body_mut(&mut self, r: ObjRef) -> &mut ObjBody {
        &mut self.gc.heap_mut().get_mut(r).body
    }

    // store barrier plus size accounting after a mutation of `r`
    fn stored(&mut self, r: ObjRef, values: &[Value]) {
        for v in values {
            self.gc.write_barrier(r, *v);
        }
        let size = self.gc.heap().get(r).body.size_hint();
        self.gc.heap_mut().resize(r, size);
    }

    /// Contents of a string value, heap or shared
    pub fn str_content(&self, value: Value) -> MaatResult<Arc<str>> {
        let r = value.obj_ref();
        match value.kind() {
            Kind::Str | Kind::U8Str => {}
            other => return Err(MaatError::TypeError { expected: Kind::Str, found: other }),
        }
        match r {
            Some(r) if r.is_shared() => {
                let obj = self.runtime.sos().get(r);
                match &obj.body {
                    SharedBody::Str(s) => Ok(s.content().clone()),
                    SharedBody::U8Str(s) => Ok(Arc::from(s.as_str())),
                    _ => Err(MaatError::TypeError { expected: Kind::Str, found: obj.kind() }),
                }
            }
            _ => match &self.object(value)?.body {
                ObjBody::Str(s) => Ok(s.content().clone()),
                ObjBody::U8Str(s) => Ok(Arc::from(s.as_str())),
                other => body_mismatch(Kind::Str, other),
            },
        }
    }

    /// Number of elements of an array
    pub fn array_len(&self, array: Value) -> MaatResult<usize> {
        let r = self.owned(array, Kind::Array)?;
        match &self.gc.heap().get(r).body {
            ObjBody::Array(a) => Ok(a.len()),
            other => body_mismatch(Kind::Array, other),
        }
    }

    /// Element `index` of an array
    pub fn array_get(&self, array: Value, index: usize) -> MaatResult<Value> {
        let r = self.owned(array, Kind::Array)?;
        match &self.gc.heap().get(r).body {
            ObjBody::Array(a) => a.get(index).ok_or(MaatError::IndexOutOfBounds(index)),
            other => body_mismatch(Kind::Array, other),
        }
    }

    /// Overwrite element `index` of an array
    pub fn array_set(&mut self, array: Value, index: usize, value: Value) -> MaatResult<()> {
        let r = self.owned(array, Kind::Array)?;
        let stored = match self.body_mut(r) {
            ObjBody::Array(a) => a.set(index, value),
            other => body_mismatch(Kind::Array, other),
        };
        if !stored {
            return Err(MaatError::IndexOutOfBounds(index));
        }
        self.gc.write_barrier(r, value);
        Ok(())
    }

    /// Append to an array
    pub fn array_push(&mut self, array: Value, value: Value) -> MaatResult<()> {
        let r = self.owned(array, Kind::Array)?;
        match self.body_mut(r) {
            ObjBody::Array(a) => a.push(value),
            other => body_mismatch(Kind::Array, other),
        }
        self.stored(r, &[value]);
        Ok(())
    }

    /// Remove the last element of an array
    pub fn array_pop(&mut self, array: Value) -> MaatResult<Option<Value>> {
        let r = self.owned(array, Kind::Array)?;
        match self.body_mut(r) {
            ObjBody::Array(a) => Ok(a.pop()),
            other => body_mismatch(Kind::Array, other),
        }
    }

    fn resolve_key(&self, key: Value) -> MaatResult<ResolvedKey> {
        let key = match key {
            Value::Nil(_) => return Err(MaatError::InvalidKey(Kind::Nil)),
            Value::Num(n) if n.is_nan() => return Err(MaatError::InvalidKey(Kind::Num)),
            Value::Bool(b) => MapKey::Bool(b),
            Value::Num(n) => MapKey::Num(n),
            Value::CFunc(f) => MapKey::Ptr(f.0 as usize),
            Value::CData(d) => MapKey::Ptr(d.0 as usize),
            Value::Obj(tag, _) if matches!(tag.kind(), Kind::Str | Kind::U8Str) => {
                return Ok(ResolvedKey::Str(self.str_content(key)?));
            }
            Value::Obj(_, r) => MapKey::Obj(r),
        };
        Ok(ResolvedKey::Plain(key))
    }

    /// Value stored under `key`, or the absent-key nil
    pub fn map_get(&self, map: Value, key: Value) -> MaatResult<Value> {
        let r = self.owned(map, Kind::Map)?;
        let key = self.resolve_key(key)?;
        match &self.gc.heap().get(r).body {
            ObjBody::Map(m) => Ok(m.get(&key.key(), self.runtime.seed())),
            other => body_mismatch(Kind::Map, other),
        }
    }

    /// Store `value` under `key`; returns the previous value
    pub fn map_set(&mut self, map: Value, key: Value, value: Value) -> MaatResult<Option<Value>> {
        let r = self.owned(map, Kind::Map)?;
        let resolved = self.resolve_key(key)?;
        let seed = self.runtime.seed();
        let old = match self.body_mut(r) {
            ObjBody::Map(m) => m.insert(resolved.key(), key, value, seed),
            other => body_mismatch(Kind::Map, other),
        };
        self.stored(r, &[key, value]);
        Ok(old)
    }

    /// Remove `key`; returns the removed value
    pub fn map_remove(&mut self, map: Value, key: Value) -> MaatResult<Option<Value>> {
        let r = self.owned(map, Kind::Map)?;
        let resolved = self.resolve_key(key)?;
        let seed = self.runtime.seed();
        match self.body_mut(r) {
            ObjBody::Map(m) => Ok(m.remove(&resolved.key(), seed)),
            other => body_mismatch(Kind::Map, other),
        }
    }

    /// Number of entries of a map
    pub fn map_len(&self, map: Value) -> MaatResult<usize> {
        let r = self.owned(map, Kind::Map)?;
        match &self.gc.heap().get(r).body {
            ObjBody::Map(m) => Ok(m.len()),
            other => body_mismatch(Kind::Map, other),
        }
    }

    /// Attribute at `index` of an instance
    pub fn field_get(&self, instance: Value, index: usize) -> MaatResult<Value> {
        let r = self.owned(instance, Kind::Instance)?;
        match &self.gc.heap().get(r).body {
            ObjBody::Instance(i) => i
                .fields
                .get(index)
                .copied()
                .ok_or(MaatError::IndexOutOfBounds(index)),
            other => body_mismatch(Kind::Instance, other),
        }
    }

    /// Overwrite the attribute at `index` of an instance
    pub fn field_set(&mut self, instance: Value, index: usize, value: Value) -> MaatResult<()> {
        let r = self.owned(instance, Kind::Instance)?;
        match self.body_mut(r) {
            ObjBody::Instance(i) => match i.fields.get_mut(index) {
                Some(slot) => *slot = value,
                None => return Err(MaatError::IndexOutOfBounds(index)),
            },
            other => body_mismatch(Kind::Instance, other),
        }
        self.gc.write_barrier(r, value);
        Ok(())
    }

    /// Attribute index of `name` in the class of `instance`
    pub fn field_index(&self, instance: Value, name: &str) -> MaatResult<Option<usize>> {
        let r = self.owned(instance, Kind::Instance)?;
        let class = self.gc.heap().get(r).header.class;
        let obj = self.runtime.sos().get(class);
        Ok(obj.as_class().and_then(|c| c.field_index(name)))
    }

    // ---- namespaces and channels --------------------------------------------

    /// Copy a value into the shared object space
    ///
    /// Non-collectable and already shared values are returned as is.
    /// Strings, ranges and closures without upvalues are copied; any other
    /// heap object is rejected with [`MaatError::NotShareable`].
    pub fn promote(&mut self, value: Value) -> MaatResult<Value> {
        if !value.is_collectable() || value.is_shared() {
            return Ok(value);
        }
        let runtime = Arc::clone(&self.runtime);
        let classes = runtime.classes();
        let obj = self.object(value)?;
        let tag = obj.header.tag;
        let body = match &obj.body {
            ObjBody::Str(s) if s.len() <= MAX_SHORT_LEN => return Ok(runtime.intern(s.as_str())),
            ObjBody::Str(s) => SharedBody::Str(StrObj::long(s.content().clone())),
            ObjBody::U8Str(s) => SharedBody::U8Str(U8StrObj::new(Arc::from(s.as_str()))),
            ObjBody::Range(range) => SharedBody::Range(*range),
            ObjBody::Closure(c) if c.upvals.is_empty() => SharedBody::Closure(c.clone()),
            _ => return Err(MaatError::NotShareable(tag.kind())),
        };
        let r = runtime.sos().insert(tag, classes.for_kind(tag.kind()), body);
        Ok(Value::Obj(tag, r))
    }

    /// Global `symbol` of namespace `ns`
    pub fn global(&self, ns: Value, symbol: &str) -> MaatResult<Value> {
        self.runtime.sos().ns_get(ns.try_ns()?, symbol)
    }

    /// Bind global `symbol` of namespace `ns`, promoting `value` first
    pub fn set_global(&mut self, ns: Value, symbol: &str, value: Value) -> MaatResult<()> {
        let ns = ns.try_ns()?;
        let value = self.promote(value)?;
        self.runtime.sos().ns_set(ns, symbol, value)
    }

    /// Send `value` (promoted first) on a channel
    pub fn channel_send(&mut self, channel: Value, value: Value) -> MaatResult<()> {
        channel.try_rbq()?;
        let value = self.promote(value)?;
        let obj = self.runtime.shared(channel)?;
        let ch = obj.as_channel().ok_or(MaatError::TypeError {
            expected: Kind::Rbq,
            found: obj.kind(),
        })?;
        self.runtime.sos().mark_value(value);
        ch.try_send(value)
    }

    /// Receive from a channel
    pub fn channel_recv(&mut self, channel: Value) -> MaatResult<Value> {
        channel.try_rbq()?;
        let obj = self.runtime.shared(channel)?;
        let ch = obj.as_channel().ok_or(MaatError::TypeError {
            expected: Kind::Rbq,
            found: obj.kind(),
        })?;
        let value = ch.try_recv()?;
        self.runtime.sos().mark_value(value);
        Ok(value)
    }

    // ---- states -------------------------------------------------------------

    fn state_ref(&self, r: ObjRef) -> &StateObj {
        match &self.gc.heap().get(r).body {
            ObjBody::State(s) => s,
            other => body_mismatch(Kind::State, other),
        }
    }

    pub(crate) fn state_mut_of(&mut self, r: ObjRef) -> &mut StateObj {
        match self.body_mut(r) {
            ObjBody::State(s) => s,
            other => body_mismatch(Kind::State, other),
        }
    }

    /// The executing State
    pub fn state(&self) -> &StateObj {
        self.state_ref(self.current)
    }

    /// The executing State, mutable
    ///
    /// States are re-scanned before every sweep, so stores into their
    /// stacks need no barrier.
    pub fn state_mut(&mut self) -> &mut StateObj {
        let current = self.current;
        self.state_mut_of(current)
    }

    /// State behind a State value
    pub fn state_of(&self, state: Value) -> MaatResult<&StateObj> {
        let r = self.owned(state, Kind::State)?;
        Ok(self.state_ref(r))
    }

    /// Push onto the executing State's stack
    pub fn push(&mut self, value: Value) {
        self.state_mut().push(value);
    }

    /// Pop from the executing State's stack
    pub fn pop(&mut self) -> Option<Value> {
        self.state_mut().pop()
    }

    /// Pop the top `n` values, oldest first
    pub fn pop_values(&mut self, n: usize) -> Vec<Value> {
        let stack = &mut self.state_mut().stack;
        let at = stack.len().saturating_sub(n);
        stack.split_off(at)
    }

    /// Temporaries map of the innermost frame, created on first use
    pub fn frame_temps(&mut self) -> MaatResult<Value> {
        if let Some(t) = self.state().frame().and_then(|f| f.temps) {
            return Ok(Value::object(Kind::Map, 0, t));
        }
        let map = self.new_map()?;
        match self.state_mut().frame_mut() {
            Some(frame) => frame.temps = map.obj_ref(),
            None => return Err(MaatError::NoCaller),
        }
        Ok(map)
    }

    // ---- upvalues -----------------------------------------------------------

    /// Upvalue for stack slot `slot` of the executing State
    pub fn capture_upval(&mut self, slot: usize) -> MaatResult<ObjRef> {
        if let Some(u) = self.state().find_open_upval(slot) {
            return Ok(u);
        }
        let state = self.current;
        let upval = self.alloc(ObjBody::Upval(UpvalObj::Open { state, slot }))?;
        let u = upval.as_upval();
        self.state_mut().add_open_upval(slot, u);
        Ok(u)
    }

    /// Current value of an upvalue
    pub fn upval_get(&self, upval: ObjRef) -> MaatResult<Value> {
        match self.upval(upval) {
            UpvalObj::Open { state, slot } => self
                .state_ref(state)
                .stack
                .get(slot)
                .copied()
                .ok_or(MaatError::IndexOutOfBounds(slot)),
            UpvalObj::Closed(v) => Ok(v),
        }
    }

    fn upval(&self, upval: ObjRef) -> UpvalObj {
        match &self.gc.heap().get(upval).body {
            ObjBody::Upval(u) => *u,
            other => body_mismatch(Kind::Upval, other),
        }
    }

    /// Assign through an upvalue
    pub fn upval_set(&mut self, upval: ObjRef, value: Value) -> MaatResult<()> {
        match self.upval(upval) {
            UpvalObj::Open { state, slot } => {
                let stack = &mut self.state_mut_of(state).stack;
                match stack.get_mut(slot) {
                    Some(v) => *v = value,
                    None => return Err(MaatError::IndexOutOfBounds(slot)),
                }
            }
            UpvalObj::Closed(_) => {
                *self.body_mut(upval) = ObjBody::Upval(UpvalObj::Closed(value));
                self.gc.write_barrier(upval, value);
            }
        }
        Ok(())
    }

    /// Close the open upvalues of `state` at or above stack slot `level`
    pub fn close_upvals(&mut self, state: ObjRef, level: usize) {
        let closing = self.state_mut_of(state).take_open_upvals(level);
        for (slot, u) in closing {
            let value = self
                .state_ref(state)
                .stack
                .get(slot)
                .copied()
                .unwrap_or(Value::NIL);
            *self.body_mut(u) = ObjBody::Upval(UpvalObj::Closed(value));
            self.gc.write_barrier(u, value);
        }
    }

    // ---- calls and coroutines -----------------------------------------------

    /// Call `f` with `args` on the executing State and wait for its result
    ///
    /// Native functions are called directly; closures go through
    /// `dispatch`. A yield that would cross this call fails with
    /// [`MaatError::NoCaller`].
    pub fn call(&mut self, dispatch: &mut dyn Dispatch, f: Value, args: &[Value]) -> MaatResult<Value> {
        match f {
            Value::CFunc(native) => native.call(self, args),
            Value::Obj(tag, _) if tag.kind() == Kind::Fun => self.call_closure(dispatch, f, args),
            other => Err(MaatError::NotCallable(other.kind())),
        }
    }

    fn call_closure(&mut self, dispatch: &mut dyn Dispatch, f: Value, args: &[Value]) -> MaatResult<Value> {
        let state = self.current;
        if self.state_ref(state).frames.len() >= MAX_CALL_DEPTH {
            let message = self.new_str("stack overflow")?;
            return Err(MaatError::Thrown(message));
        }
        let (depth, base) = {
            let st = self.state_mut_of(state);
            let base = st.stack.len();
            st.stack.extend_from_slice(args);
            st.frames.push(CallFrame::new(f, base));
            (st.frames.len() - 1, base)
        };

        let exit = dispatch.execute(self, depth);
        self.current = state;
        let result = match exit {
            Ok(Exit::Return(n)) => {
                let stack = &self.state_ref(state).stack;
                let at = stack.len().saturating_sub(n).max(base);
                Ok(if n == 0 {
                    Value::NIL
                } else {
                    stack.get(at).copied().unwrap_or(Value::NIL)
                })
            }
            Ok(Exit::Yield(_)) => Err(MaatError::NoCaller),
            Err(e) => Err(e),
        };

        self.close_upvals(state, base);
        let st = self.state_mut_of(state);
        st.frames.truncate(depth);
        st.stack.truncate(base);
        result
    }

    /// Resume a coroutine, passing `args`
    ///
    /// On the first resume the arguments become the body's parameters; on
    /// later ones they are the results of the pending yield. Makes `co` the
    /// executing State; control comes back through [`Maatine::yield_values`]
    /// or [`Maatine::finish`].
    pub fn resume(&mut self, co: Value, args: &[Value]) -> MaatResult<()> {
        let r = match co {
            Value::Obj(tag, r) if tag.kind() == Kind::State => r,
            _ => return Err(MaatError::NotACoroutine),
        };
        if !self.gc.heap().owns(r) {
            return Err(MaatError::CrossMaatine);
        }
        let caller = self.current;
        let id = self.id;
        let st = self.state_mut_of(r);
        if !st.is_coroutine() {
            return Err(MaatError::NotACoroutine);
        }
        if st.owner != id {
            return Err(MaatError::CrossMaatine);
        }
        match st.status {
            CoStatus::Dead { .. } => return Err(MaatError::DeadCoroutine),
            CoStatus::Running | CoStatus::Normal => return Err(MaatError::NotSuspended),
            CoStatus::Initial => {
                st.stack.extend_from_slice(args);
                let body = st.body;
                st.frames.push(CallFrame::new(body, 0));
            }
            CoStatus::Yielded => st.stack.extend_from_slice(args),
        }
        st.status = CoStatus::Running;
        st.back = BackRef::Caller(caller);
        self.state_mut_of(caller).status = CoStatus::Normal;
        self.current = r;
        Ok(())
    }

    fn caller_of_current(&self) -> MaatResult<ObjRef> {
        let st = self.state();
        match st.back {
            BackRef::Caller(caller) if st.is_coroutine() => Ok(caller),
            _ => Err(MaatError::NoCaller),
        }
    }

    /// Suspend the executing coroutine, moving its top `n` values to the
    /// resumer's stack
    pub fn yield_values(&mut self, n: usize) -> MaatResult<()> {
        let caller = self.caller_of_current()?;
        let values = {
            let st = self.state_mut();
            let at = st.stack.len().checked_sub(n).ok_or(MaatError::IndexOutOfBounds(n))?;
            let values = st.stack.split_off(at);
            st.status = CoStatus::Yielded;
            st.back = BackRef::None;
            values
        };
        let resumer = self.state_mut_of(caller);
        resumer.status = CoStatus::Running;
        resumer.stack.extend(values);
        self.current = caller;
        Ok(())
    }

    /// End the executing coroutine
    ///
    /// `Ok(n)` returns its top `n` values to the resumer; an error kills
    /// it as failed and is handed back. Either way the coroutine's open
    /// upvalues are closed and its stacks released.
    pub fn finish(&mut self, result: MaatResult<usize>) -> MaatResult<usize> {
        let caller = self.caller_of_current()?;
        let co = self.current;
        self.close_upvals(co, 0);
        let values = {
            let st = self.state_mut_of(co);
            let values = match &result {
                Ok(n) => {
                    let at = st.stack.len().saturating_sub(*n);
                    st.stack.split_off(at)
                }
                Err(_) => Vec::new(),
            };
            st.status = CoStatus::Dead { errored: result.is_err() };
            st.back = BackRef::None;
            st.stack = Vec::new();
            st.frames = Vec::new();
            values
        };
        let size = self.gc.heap().get(co).body.size_hint();
        self.gc.heap_mut().resize(co, size);

        let count = values.len();
        let resumer = self.state_mut_of(caller);
        resumer.status = CoStatus::Running;
        resumer.stack.extend(values);
        self.current = caller;
        result.map(|_| count)
    }

    /// Resume `co` and drive it through `dispatch` until it yields or ends
    pub fn run_coroutine(
        &mut self,
        dispatch: &mut dyn Dispatch,
        co: Value,
        args: &[Value],
    ) -> MaatResult<CoResult> {
        self.resume(co, args)?;
        let body = self.state().body;
        let exit = match body {
            // a native body runs to completion in one go
            Value::CFunc(native) => {
                let params = self.pop_values(args.len());
                native.call(self, &params).map(|v| {
                    self.push(v);
                    Exit::Return(1)
                })
            }
            _ => dispatch.execute(self, 0),
        };
        match exit {
            Ok(Exit::Yield(n)) => {
                self.yield_values(n)?;
                Ok(CoResult::Yielded(n))
            }
            Ok(Exit::Return(n)) => self.finish(Ok(n)).map(CoResult::Returned),
            Err(e) => self.finish(Err(e)).map(CoResult::Returned),
        }
    }

    // ---- errors and slices --------------------------------------------------

    /// Hand an unhandled error to the top-level reporter
    pub fn report(&mut self, err: MaatError) {
        error!(target: "maat::work", maatine = %self.id, error = %err, "unhandled error");
        self.errors.push(err);
    }

    /// Errors reported so far
    pub fn errors(&self) -> &[MaatError] {
        &self.errors
    }

    /// Take the reported errors
    pub fn take_errors(&mut self) -> Vec<MaatError> {
        std::mem::take(&mut self.errors)
    }

    /// Kill the Maatine after `err`
    pub fn terminate(&mut self, err: MaatError) {
        self.report(err);
        self.status = MaatineStatus::Dead;
        self.ready.clear();
        self.running.clear();
        let primary = self.primary;
        self.current = primary;
        self.state_mut_of(primary).status = CoStatus::Dead { errored: true };
    }

    /// Run queued Works until the queue drains, a Work blocks, or `budget`
    /// Works ran
    pub fn run_slice(&mut self, dispatch: &mut dyn Dispatch, budget: usize) -> SliceOutcome {
        if self.status == MaatineStatus::Dead {
            return SliceOutcome::Terminated;
        }
        self.status = MaatineStatus::Running;
        for _ in 0..budget.max(1) {
            self.safe_point();
            let Some(work) = self.ready.try_pop() else {
                self.status = MaatineStatus::Idle;
                return SliceOutcome::Idle;
            };
            match self.run_work(dispatch, work) {
                Ok(true) => {}
                Ok(false) => {
                    self.status = MaatineStatus::Blocked;
                    return SliceOutcome::Blocked;
                }
                Err(e) => {
                    self.terminate(e);
                    return SliceOutcome::Terminated;
                }
            }
        }
        if self.ready.is_empty() {
            self.status = MaatineStatus::Idle;
            SliceOutcome::Idle
        } else {
            self.status = MaatineStatus::Ready;
            SliceOutcome::Yielded
        }
    }
}

impl Drop for Maatine {
    fn drop(&mut self) {
        trace!(target: "maat::sched", maatine = %self.id, "maatine retired");
        self.runtime.retire_maatine(self.id);
    }
}

impl fmt::Debug for Maatine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Maatine")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("objects", &self.gc.heap().object_count())
            .field("ready", &self.ready.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeOptions;

    fn maatine() -> Maatine {
        let runtime = Runtime::new(RuntimeOptions {
            seed: Some(3),
            ..RuntimeOptions::default()
        })
        .unwrap();
        Maatine::new(runtime).unwrap()
    }

    struct NoDispatch;

    impl Dispatch for NoDispatch {
        fn execute(&mut self, _: &mut Maatine, _: usize) -> MaatResult<Exit> {
            unreachable!("native-only test")
        }
    }

    fn double(_: &mut Maatine, args: &[Value]) -> MaatResult<Value> {
        Ok(Value::Num(args[0].try_num()? * 2.0))
    }

    #[test]
    fn test_ids_are_unique() {
        let a = maatine();
        let b = maatine();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.heap().space(), a.id().as_u32());
    }

    #[test]
    fn test_short_strings_are_shared() {
        let mut ma = maatine();
        let s = ma.new_str("hi").unwrap();
        assert!(s.is_shared());
        let long = ma.new_str(&"y".repeat(100)).unwrap();
        assert!(!long.is_shared());
        assert_eq!(ma.str_content(long).unwrap().len(), 100);
    }

    #[test]
    fn test_map_string_keys_by_content() {
        let mut ma = maatine();
        let map = ma.new_map().unwrap();
        let long_a = ma.new_str(&"k".repeat(60)).unwrap();
        let long_b = ma.new_str(&"k".repeat(60)).unwrap();
        assert_ne!(long_a, long_b);
        ma.map_set(map, long_a, Value::Num(1.0)).unwrap();
        assert_eq!(ma.map_get(map, long_b).unwrap(), Value::Num(1.0));
        assert!(ma.map_get(map, Value::Num(5.0)).unwrap().is_abskey());
        assert!(matches!(
            ma.map_set(map, Value::NIL, Value::NIL),
            Err(MaatError::InvalidKey(Kind::Nil))
        ));
    }

    #[test]
    fn test_cross_maatine_access_rejected() {
        let mut a = maatine();
        let b = maatine();
        let array = a.new_array(false).unwrap();
        assert!(matches!(b.array_len(array), Err(MaatError::CrossMaatine)));
    }

    #[test]
    fn test_native_call() {
        let mut ma = maatine();
        let f = Value::CFunc(crate::value::NativeFn(double));
        assert_eq!(ma.call(&mut NoDispatch, f, &[Value::Num(4.0)]).unwrap(), Value::Num(8.0));
        assert!(matches!(
            ma.call(&mut NoDispatch, Value::Num(1.0), &[]),
            Err(MaatError::NotCallable(Kind::Num))
        ));
    }

    #[test]
    fn test_upvalue_closes_over_stack_value() {
        let mut ma = maatine();
        ma.push(Value::Num(10.0));
        let u = ma.capture_upval(0).unwrap();
        assert_eq!(ma.capture_upval(0).unwrap(), u);
        ma.upval_set(u, Value::Num(11.0)).unwrap();
        assert_eq!(ma.state().stack[0], Value::Num(11.0));

        let primary = ma.primary().as_state();
        ma.close_upvals(primary, 0);
        ma.pop();
        assert_eq!(ma.upval_get(u).unwrap(), Value::Num(11.0));
        assert!(ma.state().open_upvals.is_empty());
    }

    #[test]
    fn test_promote() {
        let mut ma = maatine();
        let range = ma.new_range(1.0, 5.0).unwrap();
        let shared = ma.promote(range).unwrap();
        assert!(shared.is_shared());
        assert_eq!(shared.kind(), Kind::Range);
        let map = ma.new_map().unwrap();
        assert!(matches!(ma.promote(map), Err(MaatError::NotShareable(Kind::Map))));
    }

    #[test]
    fn test_native_coroutine_runs_to_end() {
        let mut ma = maatine();
        let co = ma
            .new_coroutine(Value::CFunc(crate::value::NativeFn(double)), false)
            .unwrap();
        let result = ma.run_coroutine(&mut NoDispatch, co, &[Value::Num(2.0)]).unwrap();
        assert_eq!(result, CoResult::Returned(1));
        assert_eq!(ma.pop(), Some(Value::Num(4.0)));
        assert!(matches!(
            ma.run_coroutine(&mut NoDispatch, co, &[]),
            Err(MaatError::DeadCoroutine)
        ));
    }
}
