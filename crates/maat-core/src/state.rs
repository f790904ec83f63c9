//! Execution states
//!
//! A State is a suspendable call stack: call frames plus a growable value
//! stack and the list of upvalues still pointing into that stack. Every
//! Maatine has one primary State; coroutines and generators are additional
//! States of the same Maatine linked to whoever resumed them through
//! [`BackRef`].
//!
//! State transitions are driven by [`crate::Maatine::resume`],
//! [`crate::Maatine::yield_values`] and [`crate::Maatine::finish`]:
//!
//! ```text
//! Initial --resume--> Running --yield--> Yielded --resume--> Running
//!                        |   \--resume other--> Normal --other yields/ends--> Running
//!                        \--return/throw--> Dead
//! ```

use crate::maatine::MaatineId;
use crate::object::ObjRef;
use crate::value::{variant, Kind, Value};

/// Coroutine status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    /// Created, never resumed
    Initial,
    /// Currently executing
    Running,
    /// Resumed another coroutine and waits for it
    Normal,
    /// Suspended by a yield
    Yielded,
    /// Returned (`errored == false`) or failed
    Dead {
        /// The body ended with an exception
        errored: bool,
    },
}

impl CoStatus {
    /// Whether the State can be resumed
    pub fn is_resumable(self) -> bool {
        matches!(self, CoStatus::Initial | CoStatus::Yielded)
    }

    /// Whether the State has ended
    pub fn is_dead(self) -> bool {
        matches!(self, CoStatus::Dead { .. })
    }
}

/// Who control returns to when a State yields or ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackRef {
    /// Not running on behalf of anybody (primary State, suspended coroutine)
    None,
    /// The State that resumed this one
    Caller(ObjRef),
    /// The Work this State executes
    Work(ObjRef),
}

/// One activation record
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Program counter into the closure's code
    pub ip: usize,
    /// Stack index of the first argument
    pub base: usize,
    /// Function or closure being executed
    pub closure: Value,
    /// Map holding the frame's positional and match temporaries, created on demand
    pub temps: Option<ObjRef>,
}

impl CallFrame {
    /// Frame entering `closure` with its arguments starting at `base`
    pub fn new(closure: Value, base: usize) -> Self {
        Self {
            ip: 0,
            base,
            closure,
            temps: None,
        }
    }
}

/// Execution state object
#[derive(Debug)]
pub struct StateObj {
    variant: u8,
    /// Owning Maatine
    pub owner: MaatineId,
    /// Call frames, innermost last
    pub frames: Vec<CallFrame>,
    /// Value stack
    pub stack: Vec<Value>,
    /// Open upvalues as (stack slot, upvalue), ascending by slot
    pub open_upvals: Vec<(usize, ObjRef)>,
    /// Coroutine status
    pub status: CoStatus,
    /// Where control goes on yield or end
    pub back: BackRef,
    /// Body run on first resume (coroutines and generators)
    pub body: Value,
}

impl StateObj {
    /// Primary State of a Maatine
    pub fn primary(owner: MaatineId) -> Self {
        Self {
            variant: variant::STATE_PRIMARY,
            owner,
            frames: Vec::new(),
            stack: Vec::new(),
            open_upvals: Vec::new(),
            status: CoStatus::Running,
            back: BackRef::None,
            body: Value::NIL,
        }
    }

    /// Coroutine (or generator) that runs `body` when first resumed
    pub fn coroutine(owner: MaatineId, body: Value, generator: bool) -> Self {
        Self {
            variant: if generator { variant::STATE_GEN } else { variant::STATE_CO },
            status: CoStatus::Initial,
            body,
            ..Self::primary(owner)
        }
    }

    /// Tag variant
    pub fn variant(&self) -> u8 {
        self.variant
    }

    /// Whether this is a coroutine or generator
    pub fn is_coroutine(&self) -> bool {
        self.variant != variant::STATE_PRIMARY
    }

    /// Push a value
    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pop a value
    #[inline]
    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    /// Value `depth` slots below the top
    pub fn peek(&self, depth: usize) -> Option<Value> {
        self.stack.len().checked_sub(depth + 1).map(|i| self.stack[i])
    }

    /// Stack height
    #[inline]
    pub fn top(&self) -> usize {
        self.stack.len()
    }

    /// Innermost frame
    pub fn frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// Innermost frame, mutable
    pub fn frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    /// Open upvalue for `slot`
    pub fn find_open_upval(&self, slot: usize) -> Option<ObjRef> {
        self.open_upvals
            .binary_search_by_key(&slot, |(s, _)| *s)
            .ok()
            .map(|i| self.open_upvals[i].1)
    }

    /// Record a new open upvalue for `slot`
    pub fn add_open_upval(&mut self, slot: usize, upval: ObjRef) {
        match self.open_upvals.binary_search_by_key(&slot, |(s, _)| *s) {
            Ok(i) => self.open_upvals[i].1 = upval,
            Err(i) => self.open_upvals.insert(i, (slot, upval)),
        }
    }

    /// Detach the open upvalues at or above `level`
    pub fn take_open_upvals(&mut self, level: usize) -> Vec<(usize, ObjRef)> {
        let split = self.open_upvals.partition_point(|(s, _)| *s < level);
        self.open_upvals.split_off(split)
    }

    /// Approximate bytes owned by the State
    pub fn size_hint(&self) -> usize {
        self.stack.capacity() * std::mem::size_of::<Value>()
            + self.frames.capacity() * std::mem::size_of::<CallFrame>()
    }

    /// Visit every value the State references
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        self.stack.iter().for_each(|v| f(*v));
        for frame in &self.frames {
            f(frame.closure);
            if let Some(t) = frame.temps {
                f(Value::object(Kind::Map, 0, t));
            }
        }
        for (_, u) in &self.open_upvals {
            f(Value::object(Kind::Upval, 0, *u));
        }
        f(self.body);
        match self.back {
            BackRef::None => {}
            BackRef::Caller(s) => f(Value::object(Kind::State, 0, s)),
            BackRef::Work(w) => f(Value::object(Kind::Work, 0, w)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upval(slot: u32) -> ObjRef {
        ObjRef::new(1, slot, 0)
    }

    #[test]
    fn test_open_upvals_sorted() {
        let mut state = StateObj::primary(MaatineId::from_raw(1));
        state.add_open_upval(5, upval(5));
        state.add_open_upval(1, upval(1));
        state.add_open_upval(3, upval(3));
        assert_eq!(state.find_open_upval(3), Some(upval(3)));
        assert_eq!(state.find_open_upval(2), None);

        let closed = state.take_open_upvals(3);
        assert_eq!(closed, vec![(3, upval(3)), (5, upval(5))]);
        assert_eq!(state.open_upvals, vec![(1, upval(1))]);
    }

    #[test]
    fn test_coroutine_starts_initial() {
        let co = StateObj::coroutine(MaatineId::from_raw(1), Value::NIL, true);
        assert_eq!(co.status, CoStatus::Initial);
        assert_eq!(co.variant(), variant::STATE_GEN);
        assert!(co.status.is_resumable());
        assert!(co.is_coroutine());
    }

    #[test]
    fn test_peek() {
        let mut state = StateObj::primary(MaatineId::from_raw(1));
        state.push(Value::Num(1.0));
        state.push(Value::Num(2.0));
        assert_eq!(state.peek(0), Some(Value::Num(2.0)));
        assert_eq!(state.peek(1), Some(Value::Num(1.0)));
        assert_eq!(state.peek(2), None);
    }
}
