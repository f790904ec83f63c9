//! GC root tracking
//!
//! Roots are the starting points of a trace:
//! - The Maatine's primary and current States (their stacks, frames and open upvalues)
//! - Temporary roots pushed by native code
//! - Works waiting on the ready queue

use crate::value::Value;

/// Root set for one collection step
///
/// Built by the owning Maatine at every safe point that needs it.
pub struct RootSet {
    /// State values (primary, current)
    state_roots: Vec<Value>,

    /// Everything else (temporary roots, queued works)
    other_roots: Vec<Value>,
}

impl RootSet {
    /// Create an empty root set
    pub fn new() -> Self {
        Self {
            state_roots: Vec::new(),
            other_roots: Vec::new(),
        }
    }

    /// Add a State root
    pub fn add_state_root(&mut self, value: Value) {
        if value.is_collectable() {
            self.state_roots.push(value);
        }
    }

    /// Add any other root
    pub fn add_root(&mut self, value: Value) {
        if value.is_collectable() {
            self.other_roots.push(value);
        }
    }

    /// Iterate over all roots
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.state_roots
            .iter()
            .chain(self.other_roots.iter())
            .copied()
    }

    /// Get total number of roots
    pub fn len(&self) -> usize {
        self.state_roots.len() + self.other_roots.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Values protected by native code while it builds objects
///
/// `push` returns a mark; `truncate` pops everything pushed after it, so
/// nested native helpers release exactly what they protected.
#[derive(Debug, Default)]
pub struct TempRoots {
    values: Vec<Value>,
}

/// Position in the temporary root stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempMark(usize);

impl TempRoots {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect `value`; returns the mark to truncate back to
    pub fn push(&mut self, value: Value) -> TempMark {
        let mark = TempMark(self.values.len());
        self.values.push(value);
        mark
    }

    /// Current mark
    pub fn mark(&self) -> TempMark {
        TempMark(self.values.len())
    }

    /// Release every value pushed since `mark`
    pub fn truncate(&mut self, mark: TempMark) {
        self.values.truncate(mark.0);
    }

    /// Protected values
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().copied()
    }

    /// Number of protected values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is protected
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
