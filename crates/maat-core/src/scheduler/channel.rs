//! Channels between Maatines
//!
//! A channel is a shared object wrapping a [`RingQueue`] of shareable
//! values. Neither end ever blocks the OS thread: a full or empty channel
//! reports [`MaatError::WouldBlock`] and the Maatine yields to the
//! scheduler, retrying on its next slice.

use super::ring::RingQueue;
use crate::value::Value;
use crate::{MaatError, MaatResult};

/// Bounded multi-producer multi-consumer channel
#[derive(Debug)]
pub struct Channel {
    queue: RingQueue<Value>,
}

impl Channel {
    /// Channel buffering up to `capacity` values
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: RingQueue::new(capacity),
        }
    }

    /// Enqueue `value`, which must not reference a Maatine heap
    pub fn try_send(&self, value: Value) -> MaatResult<()> {
        if value.is_collectable() && !value.is_shared() {
            return Err(MaatError::NotShareable(value.kind()));
        }
        match self.queue.try_push(value) {
            Err(MaatError::QueueFull) => Err(MaatError::WouldBlock),
            other => other,
        }
    }

    /// Dequeue the oldest value
    ///
    /// An empty channel reports [`MaatError::WouldBlock`] while open and
    /// [`MaatError::ChannelClosed`] once closed.
    pub fn try_recv(&self) -> MaatResult<Value> {
        match self.queue.try_pop() {
            Some(v) => Ok(v),
            None if self.queue.is_closed() => Err(MaatError::ChannelClosed),
            None => Err(MaatError::WouldBlock),
        }
    }

    /// Close the channel; buffered values stay receivable
    pub fn close(&self) {
        self.queue.close();
    }

    /// Whether the channel was closed
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Buffered values
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Visit the buffered values
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        self.queue.for_each(|v| f(*v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjRef;
    use crate::value::Kind;

    #[test]
    fn test_send_recv() {
        let ch = Channel::new(1);
        ch.try_send(Value::Num(1.0)).unwrap();
        assert!(matches!(ch.try_send(Value::Num(2.0)), Err(MaatError::WouldBlock)));
        assert_eq!(ch.try_recv().unwrap(), Value::Num(1.0));
        assert!(matches!(ch.try_recv(), Err(MaatError::WouldBlock)));
        ch.close();
        assert!(matches!(ch.try_recv(), Err(MaatError::ChannelClosed)));
    }

    #[test]
    fn test_rejects_heap_values() {
        let ch = Channel::new(4);
        let local = Value::object(Kind::Map, 0, ObjRef::new(3, 0, 0));
        assert!(matches!(ch.try_send(local), Err(MaatError::NotShareable(Kind::Map))));
    }
}
