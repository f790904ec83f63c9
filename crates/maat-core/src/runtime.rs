//! Runtime context
//!
//! Everything Maatines share: the hashing seed, the shared object space with
//! its intern table, the namespace table, the builtin classes and the
//! registry of live Maatines taking part in shared passes. A runtime is
//! created once, handed to every Maatine as an `Arc`, and torn down when the
//! last Maatine and scheduler drop their handle.

use crate::config::RuntimeOptions;
use crate::maatine::MaatineId;
use crate::object::{ClassBuilder, FunObj, FunctionProto, NamespaceObj, NamespaceTable, ObjRef};
use crate::scheduler::Channel;
use crate::sos::{SharedBody, SharedObject, SharedSpace};
use crate::value::{variant, Kind, Tag, Value};
use crate::{MaatError, MaatResult};
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::debug;

/// Kinds that get a builtin class at bootstrap
const BUILTIN_KINDS: [Kind; 16] = [
    Kind::Str,
    Kind::U8Str,
    Kind::Range,
    Kind::Array,
    Kind::Map,
    Kind::Rbq,
    Kind::Fun,
    Kind::Upval,
    Kind::State,
    Kind::Ma,
    Kind::Work,
    Kind::Ns,
    Kind::Term,
    Kind::Regex,
    Kind::Io,
    Kind::Instance,
];

/// Classes bootstrapped in the shared space
#[derive(Debug)]
pub struct BuiltinClasses {
    class: ObjRef,
    by_kind: FxHashMap<Kind, ObjRef>,
}

impl BuiltinClasses {
    fn bootstrap(sos: &SharedSpace) -> Self {
        let root = ClassBuilder::new("Class").build();
        let class = sos.insert_self_classed(
            Tag::make(Kind::Class, variant::CLASS),
            SharedBody::Class(root),
        );
        let by_kind = BUILTIN_KINDS
            .iter()
            .map(|kind| {
                let body = SharedBody::Class(ClassBuilder::new(kind.name()).build());
                (*kind, sos.insert(Tag::make(Kind::Class, variant::CLASS), class, body))
            })
            .collect();
        Self { class, by_kind }
    }

    /// The root `Class` class, its own class
    pub fn class(&self) -> ObjRef {
        self.class
    }

    /// Builtin class of objects of `kind`
    pub fn for_kind(&self, kind: Kind) -> ObjRef {
        self.by_kind.get(&kind).copied().unwrap_or(self.class)
    }

    /// Every builtin class
    pub fn all(&self) -> Vec<ObjRef> {
        std::iter::once(self.class)
            .chain(self.by_kind.values().copied())
            .collect()
    }
}

#[derive(Default)]
struct Registry {
    live: FxHashSet<MaatineId>,
    pass_epoch: u32,
    // participants of the open pass and whether they reported
    members: FxHashMap<MaatineId, bool>,
}

/// Runtime context shared by all Maatines
pub struct Runtime {
    options: RuntimeOptions,
    sos: SharedSpace,
    namespaces: NamespaceTable,
    classes: BuiltinClasses,
    registry: Mutex<Registry>,
}

impl Runtime {
    /// Create a runtime
    pub fn new(options: RuntimeOptions) -> MaatResult<Arc<Self>> {
        options.gc.validate()?;
        let seed = options.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let sos = SharedSpace::new(seed, options.sos_threshold);
        let classes = BuiltinClasses::bootstrap(&sos);
        debug!(target: "maat::sos", seed, classes = sos.len(), "runtime created");
        Ok(Arc::new(Self {
            options,
            sos,
            namespaces: NamespaceTable::new(),
            classes,
            registry: Mutex::new(Registry::default()),
        }))
    }

    /// Options the runtime was created with
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// String hashing seed
    pub fn seed(&self) -> u64 {
        self.sos.seed()
    }

    /// Shared object space
    #[inline]
    pub fn sos(&self) -> &SharedSpace {
        &self.sos
    }

    /// Builtin classes
    pub fn classes(&self) -> &BuiltinClasses {
        &self.classes
    }

    /// Namespace table
    pub fn namespaces(&self) -> &NamespaceTable {
        &self.namespaces
    }

    /// Shared object behind a shared value
    pub fn shared(&self, value: Value) -> MaatResult<Arc<SharedObject>> {
        match value.obj_ref() {
            Some(r) if r.is_shared() => Ok(self.sos.get(r)),
            _ => Err(MaatError::NotShareable(value.kind())),
        }
    }

    /// Intern `s` (short strings) or store it in the shared space
    pub fn intern(&self, s: &str) -> Value {
        self.sos.intern(self.classes.for_kind(Kind::Str), s)
    }

    /// Namespace named `name`, created on first use
    pub fn define_namespace(&self, name: &str) -> Value {
        let class = self.classes.for_kind(Kind::Ns);
        let (_, r) = self.namespaces.define(name, |index| {
            let body = SharedBody::Ns(NamespaceObj::new(Arc::from(name), index));
            self.sos.insert(Tag::make(Kind::Ns, 0), class, body)
        });
        Value::object(Kind::Ns, 0, r)
    }

    /// Registered namespace named `name`
    pub fn namespace(&self, name: &str) -> Option<Value> {
        let index = self.namespaces.lookup(name)?;
        self.namespaces
            .get(index)
            .map(|r| Value::object(Kind::Ns, 0, r))
    }

    /// Store a compiled function; its constants must be shareable
    pub fn define_function(&self, proto: FunctionProto) -> MaatResult<Value> {
        if let Some(bad) = proto
            .constants
            .iter()
            .find(|v| v.is_collectable() && !v.is_shared())
        {
            return Err(MaatError::NotShareable(bad.kind()));
        }
        let tag = Tag::make(Kind::Fun, variant::FUN);
        let body = SharedBody::Fun(FunObj::from_proto(proto));
        let r = self.sos.insert(tag, self.classes.for_kind(Kind::Fun), body);
        Ok(Value::Obj(tag, r))
    }

    /// Build and store a class; defaults and methods must be shareable
    pub fn define_class(&self, builder: ClassBuilder) -> MaatResult<Value> {
        let class = builder.build();
        let mut bad = None;
        class.for_each_ref(|v| {
            if v.is_collectable() && !v.is_shared() {
                bad = Some(v.kind());
            }
        });
        if let Some(kind) = bad {
            return Err(MaatError::NotShareable(kind));
        }
        let tag = Tag::make(Kind::Class, class.variant());
        let r = self.sos.insert(tag, self.classes.class(), SharedBody::Class(class));
        Ok(Value::Obj(tag, r))
    }

    /// New channel buffering up to `capacity` values
    pub fn new_channel(&self, capacity: usize) -> Value {
        let tag = Tag::make(Kind::Rbq, variant::RBQ_CHANNEL);
        let body = SharedBody::Channel(Channel::new(capacity));
        Value::Obj(tag, self.sos.insert(tag, self.classes.for_kind(Kind::Rbq), body))
    }

    /// Number of registered Maatines
    pub fn live_maatines(&self) -> usize {
        self.registry.lock().live.len()
    }

    pub(crate) fn register_maatine(&self, id: MaatineId) {
        self.registry.lock().live.insert(id);
    }

    pub(crate) fn retire_maatine(&self, id: MaatineId) {
        let pending = {
            let mut registry = self.registry.lock();
            registry.live.remove(&id);
            let epoch = registry.pass_epoch;
            match registry.members.get_mut(&id) {
                Some(arrived) if !*arrived => {
                    *arrived = true;
                    Some(epoch)
                }
                _ => None,
            }
        };
        if let Some(epoch) = pending {
            self.sos.arrive(epoch, std::iter::empty());
            self.sos.trace_step(usize::MAX);
            self.sos.try_finish();
        }
    }

    /// Record that `id` reports its roots for the pass of `epoch`
    ///
    /// Returns false when `id` is not a participant of that pass or
    /// already reported.
    pub(crate) fn claim_arrival(&self, id: MaatineId, epoch: u32) -> bool {
        let mut registry = self.registry.lock();
        if registry.pass_epoch != epoch {
            return false;
        }
        match registry.members.get_mut(&id) {
            Some(arrived) if !*arrived => {
                *arrived = true;
                true
            }
            _ => false,
        }
    }

    /// Open a shared pass over every registered Maatine
    ///
    /// Returns the epoch, or `None` when a pass is already open.
    pub fn try_begin_shared_pass(&self) -> Option<u32> {
        let mut registry = self.registry.lock();
        let mut roots = self.namespaces.all();
        roots.extend(self.classes.all());
        let participants = registry.live.len();
        let epoch = self.sos.begin_pass(participants, &roots)?;
        registry.pass_epoch = epoch;
        registry.members = registry.live.iter().map(|id| (*id, false)).collect();
        drop(registry);

        if participants == 0 {
            self.sos.trace_step(usize::MAX);
            self.sos.try_finish();
        }
        Some(epoch)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("seed", &self.seed())
            .field("shared_objects", &self.sos.len())
            .field("namespaces", &self.namespaces.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Arc<Runtime> {
        Runtime::new(RuntimeOptions {
            seed: Some(11),
            ..RuntimeOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn test_class_class_is_its_own_class() {
        let rt = runtime();
        let root = rt.sos().get(rt.classes().class());
        assert_eq!(root.class, rt.classes().class());
        let str_class = rt.sos().get(rt.classes().for_kind(Kind::Str));
        assert_eq!(str_class.class, rt.classes().class());
        assert_eq!(str_class.as_class().unwrap().name.as_ref(), "str");
    }

    #[test]
    fn test_define_namespace_once() {
        let rt = runtime();
        let a = rt.define_namespace("app");
        let b = rt.define_namespace("app");
        assert_eq!(a, b);
        assert_eq!(rt.namespace("app"), Some(a));
        assert_eq!(rt.namespace("other"), None);
    }

    #[test]
    fn test_define_function_rejects_heap_constants() {
        let rt = runtime();
        let proto = FunctionProto {
            name: None,
            code: Arc::from(&[0u8][..]),
            constants: vec![Value::object(Kind::Array, 0, ObjRef::new(9, 0, 0))],
            arity: 0,
            namespace: 0,
            nupvals: 0,
        };
        assert!(matches!(
            rt.define_function(proto),
            Err(MaatError::NotShareable(Kind::Array))
        ));
    }

    #[test]
    fn test_pass_without_maatines_completes() {
        let rt = runtime();
        let before = rt.sos().len();
        rt.intern("temporary");
        let ns = rt.define_namespace("keep");
        rt.sos().ns_set(ns.as_ns(), "s", rt.intern("kept")).unwrap();

        rt.try_begin_shared_pass().unwrap();
        assert_eq!(rt.sos().pass_epoch(), None);
        // the unbound string is gone, the namespace and its binding stay
        assert_eq!(rt.sos().len(), before + 2);
    }
}
