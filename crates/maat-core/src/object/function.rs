//! Functions, closures and upvalues

use crate::object::ObjRef;
use crate::value::{variant, Kind, Value};
use std::sync::Arc;

/// Function as handed over by the compiler
///
/// The runtime stores the instruction stream without interpreting it; the
/// [`crate::Dispatch`] implementation reads it back through [`FunObj`].
#[derive(Debug, Clone)]
pub struct FunctionProto {
    /// Name for diagnostics
    pub name: Option<Arc<str>>,
    /// Opaque instruction stream
    pub code: Arc<[u8]>,
    /// Constant pool
    pub constants: Vec<Value>,
    /// Declared parameter count
    pub arity: u8,
    /// Index of the defining namespace in the namespace table
    pub namespace: u32,
    /// Number of upvalues a closure over this function captures
    pub nupvals: usize,
}

/// Function object (lives in the shared object space)
#[derive(Debug)]
pub struct FunObj {
    /// Name for diagnostics
    pub name: Option<Arc<str>>,
    /// Opaque instruction stream
    pub code: Arc<[u8]>,
    /// Constant pool; every constant is shareable
    pub constants: Vec<Value>,
    /// Declared parameter count
    pub arity: u8,
    /// Index of the defining namespace
    pub namespace: u32,
    /// Upvalues captured by closures
    pub nupvals: usize,
}

impl FunObj {
    /// Build from a prototype whose constants were already promoted
    pub fn from_proto(proto: FunctionProto) -> Self {
        Self {
            name: proto.name,
            code: proto.code,
            constants: proto.constants,
            arity: proto.arity,
            namespace: proto.namespace,
            nupvals: proto.nupvals,
        }
    }
}

/// Closure: a function plus captured upvalues
#[derive(Debug, Clone)]
pub struct ClosureObj {
    /// Shared function object
    pub fun: ObjRef,
    /// Captured upvalue objects
    pub upvals: Vec<ObjRef>,
}

impl ClosureObj {
    /// Visit the function and the upvalues
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        f(Value::object(Kind::Fun, variant::FUN, self.fun));
        for u in &self.upvals {
            f(Value::object(Kind::Upval, 0, *u));
        }
    }
}

/// Upvalue: a stack slot of a live State, or the value it held when closed
#[derive(Debug, Clone, Copy)]
pub enum UpvalObj {
    /// Points into `state`'s value stack
    Open {
        /// Owning State
        state: ObjRef,
        /// Absolute stack index
        slot: usize,
    },
    /// Owns the value
    Closed(Value),
}

impl UpvalObj {
    /// Whether the upvalue still points into a stack
    pub fn is_open(&self) -> bool {
        matches!(self, UpvalObj::Open { .. })
    }

    /// Visit the State of an open upvalue or the value of a closed one
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        match *self {
            UpvalObj::Open { state, .. } => f(Value::object(Kind::State, 0, state)),
            UpvalObj::Closed(v) => f(v),
        }
    }
}
