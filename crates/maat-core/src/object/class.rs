//! Classes, roles and instances
//!
//! Classes live in the shared object space and are immutable once built.
//! The linearized ancestor list is computed by the compiler and handed to
//! [`ClassBuilder::inherit`] nearest-first; the builder lays the attribute
//! buffer out base-first and resolves the method table along the same order.

use crate::object::ObjRef;
use crate::value::{variant, Value};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Class, role or native class
#[derive(Debug)]
pub struct ClassObj {
    /// Class name
    pub name: Arc<str>,
    variant: u8,
    own_fields: Vec<(Arc<str>, Value)>,
    own_methods: FxHashMap<Arc<str>, Value>,
    layout: Vec<(Arc<str>, Value)>,
    methods: FxHashMap<Arc<str>, Value>,
    supers: Vec<ObjRef>,
    roles: Vec<ObjRef>,
    ancestors: Vec<ObjRef>,
    offsets: Vec<usize>,
    own_offset: usize,
    cdata_size: usize,
}

impl ClassObj {
    /// Tag variant (class, role or cclass)
    pub fn variant(&self) -> u8 {
        self.variant
    }

    /// Whether this is a role
    pub fn is_role(&self) -> bool {
        self.variant == variant::ROLE
    }

    /// Number of attributes of an instance
    pub fn field_count(&self) -> usize {
        self.layout.len()
    }

    /// Attribute defaults in instance order
    pub fn defaults(&self) -> Vec<Value> {
        self.layout.iter().map(|(_, v)| *v).collect()
    }

    /// Attribute index of `name`, nearest definition first
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.layout.iter().rposition(|(n, _)| n.as_ref() == name)
    }

    /// Resolved method for `name`
    pub fn method(&self, name: &str) -> Option<Value> {
        self.methods.get(name).copied()
    }

    /// Linearized ancestors, nearest first, the class itself excluded
    pub fn ancestors(&self) -> &[ObjRef] {
        &self.ancestors
    }

    /// Direct superclasses
    pub fn supers(&self) -> &[ObjRef] {
        &self.supers
    }

    /// Roles composed into the class
    pub fn roles(&self) -> &[ObjRef] {
        &self.roles
    }

    /// Offset of `ancestor`'s own attributes inside an instance
    pub fn ancestor_offset(&self, ancestor: ObjRef) -> Option<usize> {
        let i = self.ancestors.iter().position(|a| *a == ancestor)?;
        Some(self.offsets[i])
    }

    /// Offset of this class's own attributes inside an instance
    pub fn own_offset(&self) -> usize {
        self.own_offset
    }

    /// Whether `other` is an ancestor or a composed role
    pub fn inherits(&self, other: ObjRef) -> bool {
        self.ancestors.contains(&other) || self.roles.contains(&other)
    }

    /// Bytes of native data carried by instances of a native class
    pub fn cdata_size(&self) -> usize {
        self.cdata_size
    }

    /// Visit every value the class references
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        use crate::value::Kind;
        self.layout.iter().for_each(|(_, v)| f(*v));
        self.methods.values().for_each(|v| f(*v));
        for r in self.ancestors.iter().chain(&self.supers).chain(&self.roles) {
            f(Value::object(Kind::Class, 0, *r));
        }
    }
}

/// Builder for [`ClassObj`]
#[derive(Debug)]
pub struct ClassBuilder {
    name: Arc<str>,
    variant: u8,
    fields: Vec<(Arc<str>, Value)>,
    methods: FxHashMap<Arc<str>, Value>,
    supers: Vec<ObjRef>,
    roles: Vec<ObjRef>,
    // (ancestor, own fields, own methods), nearest first
    ancestors: Vec<(ObjRef, Vec<(Arc<str>, Value)>, FxHashMap<Arc<str>, Value>)>,
    cdata_size: usize,
}

impl ClassBuilder {
    /// Start an ordinary class
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            variant: variant::CLASS,
            fields: Vec::new(),
            methods: FxHashMap::default(),
            supers: Vec::new(),
            roles: Vec::new(),
            ancestors: Vec::new(),
            cdata_size: 0,
        }
    }

    /// Start a role
    pub fn role(name: &str) -> Self {
        Self {
            variant: variant::ROLE,
            ..Self::new(name)
        }
    }

    /// Start a native class whose instances carry `size` bytes of native data
    pub fn native(name: &str, size: usize) -> Self {
        Self {
            variant: variant::CCLASS,
            cdata_size: size,
            ..Self::new(name)
        }
    }

    /// Declare an attribute with its default value
    pub fn field(mut self, name: &str, default: Value) -> Self {
        self.fields.push((Arc::from(name), default));
        self
    }

    /// Declare a method
    pub fn method(mut self, name: &str, body: Value) -> Self {
        self.methods.insert(Arc::from(name), body);
        self
    }

    /// Record a direct superclass
    pub fn extends(mut self, class: ObjRef) -> Self {
        self.supers.push(class);
        self
    }

    /// Record a composed role
    pub fn does(mut self, role: ObjRef) -> Self {
        self.roles.push(role);
        self
    }

    /// Append the next entry of the linearized ancestor list
    pub fn inherit(mut self, r: ObjRef, ancestor: &ClassObj) -> Self {
        self.ancestors
            .push((r, ancestor.own_fields.clone(), ancestor.own_methods.clone()));
        self
    }

    /// Lay out attributes and resolve methods
    pub fn build(self) -> ClassObj {
        let mut layout = Vec::new();
        let mut methods = FxHashMap::default();
        let mut offsets = vec![0; self.ancestors.len()];

        for (i, (_, fields, own_methods)) in self.ancestors.iter().enumerate().rev() {
            offsets[i] = layout.len();
            layout.extend(fields.iter().cloned());
            for (name, body) in own_methods {
                methods.insert(name.clone(), *body);
            }
        }
        let own_offset = layout.len();
        layout.extend(self.fields.iter().cloned());
        for (name, body) in &self.methods {
            methods.insert(name.clone(), *body);
        }

        ClassObj {
            name: self.name,
            variant: self.variant,
            own_fields: self.fields,
            own_methods: self.methods,
            layout,
            methods,
            supers: self.supers,
            roles: self.roles,
            ancestors: self.ancestors.into_iter().map(|(r, _, _)| r).collect(),
            offsets,
            own_offset,
            cdata_size: self.cdata_size,
        }
    }
}

/// Class instance; its class is recorded in the object header
#[derive(Debug, Clone)]
pub struct InstanceObj {
    /// Attribute buffer sized by the class
    pub fields: Vec<Value>,
}

impl InstanceObj {
    /// Fresh instance holding the class defaults
    pub fn new(class: &ClassObj) -> Self {
        Self {
            fields: class.defaults(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(slot: u32) -> ObjRef {
        ObjRef::new(crate::object::SHARED_SPACE, slot, 0)
    }

    #[test]
    fn test_layout_is_base_first() {
        let base = ClassBuilder::new("Base")
            .field("x", Value::Num(1.0))
            .method("describe", Value::Num(10.0))
            .build();
        let mid = ClassBuilder::new("Mid")
            .field("y", Value::Num(2.0))
            .method("describe", Value::Num(20.0))
            .inherit(shared(1), &base)
            .build();
        let leaf = ClassBuilder::new("Leaf")
            .field("x", Value::Num(3.0))
            .extends(shared(2))
            .inherit(shared(2), &mid)
            .inherit(shared(1), &base)
            .build();

        assert_eq!(leaf.field_count(), 3);
        assert_eq!(leaf.ancestor_offset(shared(1)), Some(0));
        assert_eq!(leaf.ancestor_offset(shared(2)), Some(1));
        assert_eq!(leaf.own_offset(), 2);
        // the nearest `x` shadows the base one
        assert_eq!(leaf.field_index("x"), Some(2));
        assert_eq!(leaf.method("describe"), Some(Value::Num(20.0)));
        assert!(leaf.inherits(shared(1)));

        let inst = InstanceObj::new(&leaf);
        assert_eq!(inst.fields, vec![Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)]);
    }

    #[test]
    fn test_role_and_native_variants() {
        let role = ClassBuilder::role("Printable").build();
        assert!(role.is_role());
        let native = ClassBuilder::native("File", 16).build();
        assert_eq!(native.variant(), variant::CCLASS);
        assert_eq!(native.cdata_size(), 16);
    }
}
