//! Object model
//!
//! Every collectable entity is a [`HeapObject`]: a [`Header`] followed by an
//! [`ObjBody`]. Objects live in a per-Maatine arena (see [`crate::gc::Heap`])
//! or in the shared object space, and are addressed by [`ObjRef`] handles
//! rather than pointers. A handle carries the space it belongs to, the arena
//! slot and the slot's stamp; reusing a slot bumps the stamp, so a stale
//! handle is detected instead of aliasing a newer object.

pub mod class;
pub mod function;
pub mod map;
pub mod namespace;
pub mod string;

pub use class::{ClassBuilder, ClassObj, InstanceObj};
pub use function::{ClosureObj, FunObj, FunctionProto, UpvalObj};
pub use map::{ArrayObj, MapKey, MapObj, MapSlot};
pub use namespace::{NamespaceObj, NamespaceTable};
pub use string::{StrObj, U8StrObj};

use crate::maatine::MaatineId;
use crate::state::StateObj;
use crate::value::{variant, Kind, Num, Tag, Value};
use crate::work::WorkObj;
use std::any::Any;
use std::fmt;

/// Space id of the shared object space
pub const SHARED_SPACE: u32 = 0;

/// Handle to an object in a heap arena or in the shared object space
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    space: u32,
    slot: u32,
    stamp: u32,
}

impl ObjRef {
    pub(crate) const fn new(space: u32, slot: u32, stamp: u32) -> Self {
        Self { space, slot, stamp }
    }

    /// Id of the owning space (a Maatine id, or [`SHARED_SPACE`])
    #[inline]
    pub const fn space(&self) -> u32 {
        self.space
    }

    /// Arena slot index
    #[inline]
    pub const fn slot(&self) -> u32 {
        self.slot
    }

    /// Reuse stamp of the slot
    #[inline]
    pub const fn stamp(&self) -> u32 {
        self.stamp
    }

    /// Whether the object lives in the shared object space
    #[inline]
    pub const fn is_shared(&self) -> bool {
        self.space == SHARED_SPACE
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_shared() {
            write!(f, "sos#{}.{}", self.slot, self.stamp)
        } else {
            write!(f, "ma{}#{}.{}", self.space, self.slot, self.stamp)
        }
    }
}

/// Tri-color mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Not reached yet
    White,
    /// Reached, children not scanned
    Gray,
    /// Reached and scanned
    Black,
}

/// One-byte GC mark: color (bits 0-1), old-generation bit (bit 2) and
/// minor-survival count (bits 3-7)
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Mark(u8);

impl Mark {
    const COLOR_MASK: u8 = 0b11;
    const OLD: u8 = 0b100;
    const AGE_SHIFT: u8 = 3;
    const AGE_MAX: u8 = 0x1F;

    /// Color part of the mark
    #[inline]
    pub fn color(self) -> Color {
        match self.0 & Self::COLOR_MASK {
            0 => Color::White,
            1 => Color::Gray,
            _ => Color::Black,
        }
    }

    /// Replace the color
    #[inline]
    pub fn set_color(&mut self, color: Color) {
        let bits = match color {
            Color::White => 0,
            Color::Gray => 1,
            Color::Black => 2,
        };
        self.0 = (self.0 & !Self::COLOR_MASK) | bits;
    }

    /// Whether the object belongs to the old generation
    #[inline]
    pub fn is_old(self) -> bool {
        self.0 & Self::OLD != 0
    }

    /// Move the object to the old generation
    #[inline]
    pub fn set_old(&mut self) {
        self.0 |= Self::OLD;
    }

    /// Minor collections survived
    #[inline]
    pub fn age(self) -> u8 {
        self.0 >> Self::AGE_SHIFT
    }

    /// Count one more survived minor collection
    #[inline]
    pub fn bump_age(&mut self) {
        let age = (self.age() + 1).min(Self::AGE_MAX);
        self.0 = (self.0 & 0b111) | (age << Self::AGE_SHIFT);
    }
}

impl fmt::Debug for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mark({:?}, {}, age {})",
            self.color(),
            if self.is_old() { "old" } else { "young" },
            self.age()
        )
    }
}

/// Object header
#[derive(Debug, Clone)]
pub struct Header {
    /// Kind and variant, mirroring the tag of values referencing the object
    pub tag: Tag,

    /// GC mark
    pub mark: Mark,

    /// Owning class; builtin classes live in the shared space
    pub class: ObjRef,

    /// Bytes accounted to the heap for this object
    pub size: usize,

    /// A finalizer is registered for this object
    pub finalizable: bool,
}

/// Inclusive numeric range `from..to`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeObj {
    /// First element
    pub from: Num,
    /// Last element
    pub to: Num,
}

impl RangeObj {
    /// Whether `n` lies within the range
    pub fn contains(&self, n: Num) -> bool {
        if self.from <= self.to {
            self.from <= n && n <= self.to
        } else {
            self.to <= n && n <= self.from
        }
    }
}

/// Language-level handle to a Maatine
#[derive(Debug, Clone, Copy)]
pub struct MaObj {
    /// Id of the referenced Maatine
    pub id: MaatineId,
}

/// Opaque leaf object owned by a library (terminal, regex, I/O handle)
pub struct OpaqueObj {
    /// One of [`Kind::Term`], [`Kind::Regex`] or [`Kind::Io`]
    pub kind: Kind,
    /// Library data
    pub data: Box<dyn Any + Send>,
}

impl fmt::Debug for OpaqueObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueObj({})", self.kind)
    }
}

/// Body of a heap-allocated object
#[derive(Debug)]
pub enum ObjBody {
    /// Long string
    Str(StrObj),
    /// UTF-8 string
    U8Str(U8StrObj),
    /// Range
    Range(RangeObj),
    /// Array or list
    Array(ArrayObj),
    /// Map
    Map(MapObj),
    /// Class instance
    Instance(InstanceObj),
    /// Closure
    Closure(ClosureObj),
    /// Upvalue
    Upval(UpvalObj),
    /// Execution state
    State(StateObj),
    /// Maatine proxy
    Ma(MaObj),
    /// Work task
    Work(WorkObj),
    /// Terminal, regex or I/O handle
    Opaque(OpaqueObj),
}

impl ObjBody {
    /// Tag for a freshly allocated object of this body
    pub fn default_tag(&self) -> Tag {
        match self {
            ObjBody::Str(_) => Tag::make(Kind::Str, variant::STR_LONG),
            ObjBody::U8Str(_) => Tag::make(Kind::U8Str, 0),
            ObjBody::Range(_) => Tag::make(Kind::Range, 0),
            ObjBody::Array(a) => Tag::make(Kind::Array, a.variant()),
            ObjBody::Map(_) => Tag::make(Kind::Map, 0),
            ObjBody::Instance(_) => Tag::make(Kind::Instance, 0),
            ObjBody::Closure(_) => Tag::make(Kind::Fun, variant::CLOSURE),
            ObjBody::Upval(_) => Tag::make(Kind::Upval, 0),
            ObjBody::State(s) => Tag::make(Kind::State, s.variant()),
            ObjBody::Ma(_) => Tag::make(Kind::Ma, 0),
            ObjBody::Work(_) => Tag::make(Kind::Work, 0),
            ObjBody::Opaque(o) => Tag::make(o.kind, 0),
        }
    }

    /// Bytes owned by this body outside of the header
    pub fn size_hint(&self) -> usize {
        let values = std::mem::size_of::<Value>();
        std::mem::size_of::<HeapObject>()
            + match self {
                ObjBody::Str(s) => s.len(),
                ObjBody::U8Str(s) => s.len(),
                ObjBody::Array(a) => a.len() * values,
                ObjBody::Map(m) => m.size_hint(),
                ObjBody::Instance(i) => i.fields.len() * values,
                ObjBody::Closure(c) => c.upvals.len() * std::mem::size_of::<ObjRef>(),
                ObjBody::State(s) => s.size_hint(),
                ObjBody::Work(w) => w.thens.len() * values,
                ObjBody::Range(_) | ObjBody::Upval(_) | ObjBody::Ma(_) | ObjBody::Opaque(_) => 0,
            }
    }

    /// Visit every value this object references
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        match self {
            ObjBody::Str(_)
            | ObjBody::U8Str(_)
            | ObjBody::Range(_)
            | ObjBody::Ma(_)
            | ObjBody::Opaque(_) => {}
            ObjBody::Array(a) => a.iter().for_each(|v| f(*v)),
            ObjBody::Map(m) => m.for_each_entry(|k, v| {
                f(k);
                f(v);
            }),
            ObjBody::Instance(i) => i.fields.iter().for_each(|v| f(*v)),
            ObjBody::Closure(c) => c.for_each_ref(f),
            ObjBody::Upval(u) => u.for_each_ref(f),
            ObjBody::State(s) => s.for_each_ref(f),
            ObjBody::Work(w) => w.for_each_ref(f),
        }
    }
}

/// A heap object: header plus body
#[derive(Debug)]
pub struct HeapObject {
    /// Object header
    pub header: Header,
    /// Object body
    pub body: ObjBody,
}

impl HeapObject {
    /// Value referencing this object through `r`
    #[inline]
    pub fn value(&self, r: ObjRef) -> Value {
        Value::Obj(self.header.tag, r)
    }

    /// Kind of the object
    #[inline]
    pub fn kind(&self) -> Kind {
        self.header.tag.kind()
    }

    /// Visit every value this object references, its class included
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        f(Value::object(Kind::Class, 0, self.header.class));
        self.body.for_each_ref(f);
    }
}
