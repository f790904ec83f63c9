//! Tagged value representation
//!
//! A value is a one-byte tag plus a payload. The tag layout is fixed:
//!
//! ```text
//! bit   7     6 5        4 3 2 1 0
//!     +-----+---------+-----------+
//!     |  C  | variant |   kind    |
//!     +-----+---------+-----------+
//! ```
//!
//! `kind` selects nil, bool, number, native function, native data or one of
//! the collectable object kinds; `variant` refines the kind (nil has a plain,
//! a free-slot and an absent-key variant, bool has false and true, ...); `C`
//! is set exactly when the payload is a reference to a heap object.
//!
//! [`Value`] is the closed sum type built on top of that layout. The raw
//! [`Tag`] stays available for code that needs the bit-level encoding, and
//! [`Value::from_parts`] rebuilds a value from a tag and a [`Payload`].

use crate::maatine::Maatine;
use crate::object::ObjRef;
use crate::{MaatError, MaatResult};
use std::ffi::c_void;
use std::fmt;

/// Number type selected at build time
#[cfg(not(feature = "num-f32"))]
pub type Num = f64;

/// Number type selected at build time
#[cfg(feature = "num-f32")]
pub type Num = f32;

/// Base kinds and collectable object kinds, numbered as in the tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Kind {
    /// Nil
    Nil = 0,
    /// Boolean
    Bool = 1,
    /// Number
    Num = 2,
    /// Native function
    CFunc = 3,
    /// Raw native data
    CData = 4,
    /// Class, role or native class
    Class = 5,
    /// Class instance
    Instance = 6,
    /// Byte string (short interned or long)
    Str = 7,
    /// UTF-8 string with a cached character count
    U8Str = 8,
    /// Inclusive numeric range
    Range = 9,
    /// Array or list
    Array = 10,
    /// Map
    Map = 11,
    /// Ring buffer queue (channel or scheduler queue)
    Rbq = 13,
    /// Function or closure
    Fun = 14,
    /// Upvalue
    Upval = 15,
    /// Execution state
    State = 16,
    /// Maatine proxy
    Ma = 17,
    /// Work task
    Work = 18,
    /// Namespace
    Ns = 19,
    /// Terminal handle
    Term = 20,
    /// Compiled regular expression
    Regex = 21,
    /// I/O handle
    Io = 22,
}

impl Kind {
    /// Decode a kind from the low five tag bits
    pub const fn from_code(code: u8) -> Option<Kind> {
        Some(match code {
            0 => Kind::Nil,
            1 => Kind::Bool,
            2 => Kind::Num,
            3 => Kind::CFunc,
            4 => Kind::CData,
            5 => Kind::Class,
            6 => Kind::Instance,
            7 => Kind::Str,
            8 => Kind::U8Str,
            9 => Kind::Range,
            10 => Kind::Array,
            11 => Kind::Map,
            13 => Kind::Rbq,
            14 => Kind::Fun,
            15 => Kind::Upval,
            16 => Kind::State,
            17 => Kind::Ma,
            18 => Kind::Work,
            19 => Kind::Ns,
            20 => Kind::Term,
            21 => Kind::Regex,
            22 => Kind::Io,
            _ => return None,
        })
    }

    /// Whether values of this kind reference a heap object
    #[inline]
    pub const fn is_collectable(self) -> bool {
        self as u8 >= Kind::Class as u8
    }

    /// Lower-case name used in error messages
    pub const fn name(self) -> &'static str {
        match self {
            Kind::Nil => "nil",
            Kind::Bool => "bool",
            Kind::Num => "num",
            Kind::CFunc => "cfunc",
            Kind::CData => "cdata",
            Kind::Class => "class",
            Kind::Instance => "instance",
            Kind::Str => "str",
            Kind::U8Str => "u8str",
            Kind::Range => "range",
            Kind::Array => "array",
            Kind::Map => "map",
            Kind::Rbq => "rbq",
            Kind::Fun => "fun",
            Kind::Upval => "upval",
            Kind::State => "state",
            Kind::Ma => "maatine",
            Kind::Work => "work",
            Kind::Ns => "namespace",
            Kind::Term => "term",
            Kind::Regex => "regex",
            Kind::Io => "io",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Variant numbers per kind (tag bits 5-6)
pub mod variant {
    /// Plain nil
    pub const NIL_PLAIN: u8 = 0;
    /// Free slot marker inside maps and arrays
    pub const NIL_FREE: u8 = 1;
    /// Result of looking up an absent key
    pub const NIL_ABSKEY: u8 = 2;

    /// false
    pub const BOOL_FALSE: u8 = 0;
    /// true
    pub const BOOL_TRUE: u8 = 1;

    /// Long string with lazily computed hash
    pub const STR_LONG: u8 = 0;
    /// Short interned string
    pub const STR_SHORT: u8 = 1;

    /// Ordinary class
    pub const CLASS: u8 = 0;
    /// Role (mixin)
    pub const ROLE: u8 = 1;
    /// Class whose instances carry native data
    pub const CCLASS: u8 = 2;

    /// Array
    pub const ARRAY: u8 = 0;
    /// List
    pub const LIST: u8 = 1;

    /// Plain function
    pub const FUN: u8 = 0;
    /// Closure
    pub const CLOSURE: u8 = 1;

    /// Primary state of a Maatine
    pub const STATE_PRIMARY: u8 = 0;
    /// Coroutine
    pub const STATE_CO: u8 = 1;
    /// Generator
    pub const STATE_GEN: u8 = 2;

    /// Inter-Maatine channel
    pub const RBQ_CHANNEL: u8 = 1;
    /// Scheduler ready queue
    pub const RBQ_SCHEDQ: u8 = 2;
}

/// One-byte value tag
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Tag(u8);

impl Tag {
    /// Collectable bit
    pub const COLLECTABLE: u8 = 0x80;

    const KIND_MASK: u8 = 0x1F;
    const VARIANT_SHIFT: u8 = 5;
    const VARIANT_MASK: u8 = 0x03;

    /// Build a tag from a kind and a variant
    #[inline]
    pub const fn make(kind: Kind, variant: u8) -> Tag {
        let code = kind as u8;
        let collectable = ((code >= Kind::Class as u8) as u8) << 7;
        Tag(code | ((variant & Self::VARIANT_MASK) << Self::VARIANT_SHIFT) | collectable)
    }

    /// Validate a raw tag byte
    pub const fn from_raw(raw: u8) -> Option<Tag> {
        match Kind::from_code(raw & Self::KIND_MASK) {
            Some(kind) if kind.is_collectable() == (raw & Self::COLLECTABLE != 0) => Some(Tag(raw)),
            _ => None,
        }
    }

    /// Raw tag byte
    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Kind code (bits 0-4)
    #[inline]
    pub const fn kind_code(self) -> u8 {
        self.0 & Self::KIND_MASK
    }

    /// Kind of the tag
    #[inline]
    pub fn kind(self) -> Kind {
        match Kind::from_code(self.kind_code()) {
            Some(kind) => kind,
            None => unreachable!("corrupt tag {:#04x}", self.0),
        }
    }

    /// Variant (bits 5-6)
    #[inline]
    pub const fn variant(self) -> u8 {
        (self.0 >> Self::VARIANT_SHIFT) & Self::VARIANT_MASK
    }

    /// Collectable bit (bit 7)
    #[inline]
    pub const fn is_collectable(self) -> bool {
        self.0 & Self::COLLECTABLE != 0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({}/{})", self.kind(), self.variant())
    }
}

/// Native function callable from Maat code
#[derive(Clone, Copy)]
pub struct NativeFn(pub fn(&mut Maatine, &[Value]) -> MaatResult<Value>);

impl NativeFn {
    /// Call the function
    #[inline]
    pub fn call(&self, ma: &mut Maatine, args: &[Value]) -> MaatResult<Value> {
        (self.0)(ma, args)
    }

    fn addr(&self) -> usize {
        self.0 as usize
    }
}

impl PartialEq for NativeFn {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({:#x})", self.addr())
    }
}

/// Raw pointer to native data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CData(pub *mut c_void);

// SAFETY: the runtime never dereferences a CData pointer. Native code that
// stores one is responsible for the pointee being usable from any Maatine.
unsafe impl Send for CData {}
unsafe impl Sync for CData {}

/// Flavor of nil
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NilKind {
    /// Plain nil
    Plain,
    /// Free slot marker
    Free,
    /// Absent key sentinel
    AbsKey,
}

impl NilKind {
    const fn variant(self) -> u8 {
        match self {
            NilKind::Plain => variant::NIL_PLAIN,
            NilKind::Free => variant::NIL_FREE,
            NilKind::AbsKey => variant::NIL_ABSKEY,
        }
    }

    const fn from_variant(v: u8) -> Option<NilKind> {
        match v {
            variant::NIL_PLAIN => Some(NilKind::Plain),
            variant::NIL_FREE => Some(NilKind::Free),
            variant::NIL_ABSKEY => Some(NilKind::AbsKey),
            _ => None,
        }
    }
}

/// Untyped payload of a value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    /// Nil and booleans carry no payload beyond their tag
    Empty,
    /// Number
    Num(Num),
    /// Native function
    CFunc(NativeFn),
    /// Native data
    CData(CData),
    /// Object reference
    Obj(ObjRef),
}

/// A Maat value
///
/// Values are `Copy`: non-collectable values copy their payload and
/// collectable values copy the reference, never the object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Nil in one of its flavors
    Nil(NilKind),
    /// Boolean
    Bool(bool),
    /// Number
    Num(Num),
    /// Native function
    CFunc(NativeFn),
    /// Native data pointer
    CData(CData),
    /// Object reference with its collectable tag
    Obj(Tag, ObjRef),
}

impl Default for Value {
    fn default() -> Self {
        Value::NIL
    }
}

macro_rules! obj_accessors {
    ($($as_name:ident, $try_name:ident => $kind:ident;)*) => {
        $(
            #[doc = concat!("Reference of a `", stringify!($kind), "` value; panics on any other tag")]
            #[inline]
            pub fn $as_name(&self) -> ObjRef {
                self.expect_obj(Kind::$kind)
            }

            #[doc = concat!("Reference of a `", stringify!($kind), "` value, or a type error")]
            #[inline]
            pub fn $try_name(&self) -> MaatResult<ObjRef> {
                self.try_obj(Kind::$kind)
            }
        )*
    };
}

impl Value {
    /// Plain nil
    pub const NIL: Value = Value::Nil(NilKind::Plain);

    /// Free slot marker
    pub const FREE: Value = Value::Nil(NilKind::Free);

    /// Absent key sentinel returned by failed lookups
    pub const ABSKEY: Value = Value::Nil(NilKind::AbsKey);

    /// Wrap an object reference under the given tag
    #[inline]
    pub fn object(kind: Kind, variant: u8, r: ObjRef) -> Value {
        debug_assert!(kind.is_collectable(), "{} is not an object kind", kind);
        Value::Obj(Tag::make(kind, variant), r)
    }

    /// Tag of this value
    #[inline]
    pub fn tag(&self) -> Tag {
        match self {
            Value::Nil(n) => Tag::make(Kind::Nil, n.variant()),
            Value::Bool(b) => Tag::make(Kind::Bool, *b as u8),
            Value::Num(_) => Tag::make(Kind::Num, 0),
            Value::CFunc(_) => Tag::make(Kind::CFunc, 0),
            Value::CData(_) => Tag::make(Kind::CData, 0),
            Value::Obj(tag, _) => *tag,
        }
    }

    /// Kind of this value
    #[inline]
    pub fn kind(&self) -> Kind {
        self.tag().kind()
    }

    /// Variant of this value
    #[inline]
    pub fn variant(&self) -> u8 {
        self.tag().variant()
    }

    /// Whether this value references a heap object
    #[inline]
    pub fn is_collectable(&self) -> bool {
        matches!(self, Value::Obj(..))
    }

    /// Payload of this value
    pub fn payload(&self) -> Payload {
        match *self {
            Value::Nil(_) | Value::Bool(_) => Payload::Empty,
            Value::Num(n) => Payload::Num(n),
            Value::CFunc(f) => Payload::CFunc(f),
            Value::CData(d) => Payload::CData(d),
            Value::Obj(_, r) => Payload::Obj(r),
        }
    }

    /// Rebuild a value from a tag and a payload
    ///
    /// Returns `None` when the payload does not belong to the tag's kind.
    pub fn from_parts(tag: Tag, payload: Payload) -> Option<Value> {
        match (tag.kind(), payload) {
            (Kind::Nil, Payload::Empty) => NilKind::from_variant(tag.variant()).map(Value::Nil),
            (Kind::Bool, Payload::Empty) => match tag.variant() {
                variant::BOOL_FALSE => Some(Value::Bool(false)),
                variant::BOOL_TRUE => Some(Value::Bool(true)),
                _ => None,
            },
            (Kind::Num, Payload::Num(n)) => Some(Value::Num(n)),
            (Kind::CFunc, Payload::CFunc(f)) => Some(Value::CFunc(f)),
            (Kind::CData, Payload::CData(d)) => Some(Value::CData(d)),
            (kind, Payload::Obj(r)) if kind.is_collectable() => Some(Value::Obj(tag, r)),
            _ => None,
        }
    }

    /// Whether this is any flavor of nil
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil(_))
    }

    /// Whether this is the absent key sentinel
    #[inline]
    pub fn is_abskey(&self) -> bool {
        matches!(self, Value::Nil(NilKind::AbsKey))
    }

    /// Whether this is the free slot marker
    #[inline]
    pub fn is_free(&self) -> bool {
        matches!(self, Value::Nil(NilKind::Free))
    }

    /// Nil and false are falsy, everything else is truthy
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil(_) | Value::Bool(false))
    }

    /// Object reference if this value is collectable
    #[inline]
    pub fn obj_ref(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(_, r) => Some(*r),
            _ => None,
        }
    }

    /// Whether this value references an object of the shared object space
    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self, Value::Obj(_, r) if r.is_shared())
    }

    /// Boolean payload; panics on any other tag
    #[inline]
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            other => tag_mismatch(Kind::Bool, other),
        }
    }

    /// Number payload; panics on any other tag
    #[inline]
    pub fn as_num(&self) -> Num {
        match self {
            Value::Num(n) => *n,
            other => tag_mismatch(Kind::Num, other),
        }
    }

    /// Native function payload; panics on any other tag
    #[inline]
    pub fn as_cfunc(&self) -> NativeFn {
        match self {
            Value::CFunc(f) => *f,
            other => tag_mismatch(Kind::CFunc, other),
        }
    }

    /// Native data payload; panics on any other tag
    #[inline]
    pub fn as_cdata(&self) -> CData {
        match self {
            Value::CData(d) => *d,
            other => tag_mismatch(Kind::CData, other),
        }
    }

    /// Number payload, or a type error
    pub fn try_num(&self) -> MaatResult<Num> {
        match self {
            Value::Num(n) => Ok(*n),
            other => Err(MaatError::TypeError { expected: Kind::Num, found: other.kind() }),
        }
    }

    /// Object reference of the given kind; panics on any other tag
    #[inline]
    pub fn expect_obj(&self, kind: Kind) -> ObjRef {
        match self {
            Value::Obj(tag, r) if tag.kind() == kind => *r,
            other => tag_mismatch(kind, other),
        }
    }

    /// Object reference of the given kind, or a type error
    #[inline]
    pub fn try_obj(&self, kind: Kind) -> MaatResult<ObjRef> {
        match self {
            Value::Obj(tag, r) if tag.kind() == kind => Ok(*r),
            other => Err(MaatError::TypeError { expected: kind, found: other.kind() }),
        }
    }

    obj_accessors! {
        as_class, try_class => Class;
        as_instance, try_instance => Instance;
        as_str, try_str => Str;
        as_u8str, try_u8str => U8Str;
        as_range, try_range => Range;
        as_array, try_array => Array;
        as_map, try_map => Map;
        as_rbq, try_rbq => Rbq;
        as_fun, try_fun => Fun;
        as_upval, try_upval => Upval;
        as_state, try_state => State;
        as_ma, try_ma => Ma;
        as_work, try_work => Work;
        as_ns, try_ns => Ns;
    }
}

#[cold]
#[inline(never)]
fn tag_mismatch(expected: Kind, found: &Value) -> ! {
    panic!("internal error: expected {} value, found {:?}", expected, found)
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Num> for Value {
    fn from(n: Num) -> Self {
        Value::Num(n)
    }
}

impl From<NativeFn> for Value {
    fn from(f: NativeFn) -> Self {
        Value::CFunc(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Maatine, _: &[Value]) -> MaatResult<Value> {
        Ok(Value::NIL)
    }

    #[test]
    fn test_tag_bits() {
        let tag = Tag::make(Kind::Str, variant::STR_SHORT);
        assert_eq!(tag.raw(), 7 | (1 << 5) | 0x80);
        assert_eq!(tag.kind(), Kind::Str);
        assert_eq!(tag.variant(), variant::STR_SHORT);
        assert!(tag.is_collectable());

        let nil = Tag::make(Kind::Nil, variant::NIL_ABSKEY);
        assert_eq!(nil.raw(), 2 << 5);
        assert!(!nil.is_collectable());
    }

    #[test]
    fn test_from_raw_validates_collectable_bit() {
        assert!(Tag::from_raw(Kind::Map as u8).is_none());
        assert!(Tag::from_raw(Kind::Num as u8 | Tag::COLLECTABLE).is_none());
        assert!(Tag::from_raw(12 | Tag::COLLECTABLE).is_none());
        assert_eq!(
            Tag::from_raw(Kind::Map as u8 | Tag::COLLECTABLE),
            Some(Tag::make(Kind::Map, 0))
        );
    }

    #[test]
    fn test_round_trip_scalars() {
        let values = [
            Value::NIL,
            Value::FREE,
            Value::ABSKEY,
            Value::Bool(true),
            Value::Bool(false),
            Value::Num(-2.5),
            Value::CFunc(NativeFn(noop)),
            Value::CData(CData(std::ptr::null_mut())),
        ];
        for v in values {
            let tag = Tag::make(v.kind(), v.variant());
            assert_eq!(Value::from_parts(tag, v.payload()), Some(v));
        }
    }

    #[test]
    fn test_payload_mismatch_rejected() {
        assert_eq!(Value::from_parts(Tag::make(Kind::Num, 0), Payload::Empty), None);
        assert_eq!(Value::from_parts(Tag::make(Kind::Bool, 3), Payload::Empty), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::NIL.is_truthy());
        assert!(!Value::ABSKEY.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Num(0.0).is_truthy());
    }

    #[test]
    #[should_panic(expected = "expected num value")]
    fn test_as_num_on_bool_panics() {
        Value::Bool(true).as_num();
    }

    #[test]
    fn test_try_obj_reports_kind() {
        let err = Value::Num(1.0).try_map().unwrap_err();
        assert!(matches!(err, MaatError::TypeError { expected: Kind::Map, found: Kind::Num }));
    }
}
