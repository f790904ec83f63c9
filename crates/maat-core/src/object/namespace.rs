//! Namespaces and the namespace table
//!
//! Namespace objects live in the shared object space so every Maatine sees
//! the same globals. The symbol map is read concurrently and locked only for
//! writes. Values stored in a namespace must already be shareable.

use crate::object::ObjRef;
use crate::value::Value;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Namespace object
#[derive(Debug)]
pub struct NamespaceObj {
    /// Fully qualified name
    pub name: Arc<str>,
    /// Index in the namespace table
    pub index: u32,
    symbols: RwLock<FxHashMap<Arc<str>, Value>>,
    exports: RwLock<Vec<Arc<str>>>,
}

impl NamespaceObj {
    /// Empty namespace
    pub fn new(name: Arc<str>, index: u32) -> Self {
        Self {
            name,
            index,
            symbols: RwLock::new(FxHashMap::default()),
            exports: RwLock::new(Vec::new()),
        }
    }

    /// Global named `symbol`, or the absent-key nil
    pub fn get(&self, symbol: &str) -> Value {
        self.symbols.read().get(symbol).copied().unwrap_or(Value::ABSKEY)
    }

    /// Bind `symbol`; returns the previous binding
    pub(crate) fn set(&self, symbol: &str, value: Value) -> Option<Value> {
        let mut symbols = self.symbols.write();
        match symbols.get_mut(symbol) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                symbols.insert(Arc::from(symbol), value);
                None
            }
        }
    }

    /// Remove `symbol`; returns the removed binding
    pub(crate) fn remove(&self, symbol: &str) -> Option<Value> {
        self.symbols.write().remove(symbol)
    }

    /// Add `symbol` to the export list
    pub fn export(&self, symbol: &str) {
        let mut exports = self.exports.write();
        if !exports.iter().any(|e| e.as_ref() == symbol) {
            exports.push(Arc::from(symbol));
        }
    }

    /// Exported symbols in declaration order
    pub fn exports(&self) -> Vec<Arc<str>> {
        self.exports.read().clone()
    }

    /// Number of bound symbols
    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    /// Whether no symbol is bound
    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }

    /// Visit every bound value
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        for v in self.symbols.read().values() {
            f(*v);
        }
    }
}

/// Name to namespace index table
///
/// Lookups share a read lock; registering a new namespace takes the write
/// lock so two Maatines defining the same name agree on one index.
#[derive(Debug, Default)]
pub struct NamespaceTable {
    names: RwLock<FxHashMap<Arc<str>, u32>>,
    buf: RwLock<Vec<ObjRef>>,
}

impl NamespaceTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `name`
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.names.read().get(name).copied()
    }

    /// Namespace object at `index`
    pub fn get(&self, index: u32) -> Option<ObjRef> {
        self.buf.read().get(index as usize).copied()
    }

    /// Index of `name`, creating the namespace with `create` when missing
    pub fn define(&self, name: &str, create: impl FnOnce(u32) -> ObjRef) -> (u32, ObjRef) {
        if let Some(index) = self.lookup(name) {
            if let Some(r) = self.get(index) {
                return (index, r);
            }
        }
        let mut names = self.names.write();
        if let Some(&index) = names.get(name) {
            return (index, self.buf.read()[index as usize]);
        }
        let mut buf = self.buf.write();
        let index = buf.len() as u32;
        let r = create(index);
        buf.push(r);
        names.insert(Arc::from(name), index);
        (index, r)
    }

    /// All registered namespaces
    pub fn all(&self) -> Vec<ObjRef> {
        self.buf.read().clone()
    }

    /// Number of registered namespaces
    pub fn len(&self) -> usize {
        self.buf.read().len()
    }

    /// Whether no namespace is registered
    pub fn is_empty(&self) -> bool {
        self.buf.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SHARED_SPACE;

    #[test]
    fn test_symbols_and_exports() {
        let ns = NamespaceObj::new(Arc::from("main"), 0);
        assert!(ns.get("x").is_abskey());
        assert_eq!(ns.set("x", Value::Num(1.0)), None);
        assert_eq!(ns.set("x", Value::Num(2.0)), Some(Value::Num(1.0)));
        ns.export("x");
        ns.export("x");
        assert_eq!(ns.exports().len(), 1);
        assert_eq!(ns.remove("x"), Some(Value::Num(2.0)));
        assert!(ns.is_empty());
    }

    #[test]
    fn test_define_is_idempotent() {
        let table = NamespaceTable::new();
        let mut created = 0;
        let (a, ra) = table.define("std.io", |i| {
            created += 1;
            ObjRef::new(SHARED_SPACE, i, 0)
        });
        let (b, rb) = table.define("std.io", |i| ObjRef::new(SHARED_SPACE, i + 100, 0));
        assert_eq!((a, ra), (b, rb));
        assert_eq!(created, 1);
        assert_eq!(table.lookup("std.io"), Some(0));
        assert_eq!(table.len(), 1);
    }
}
