//! Bounded ring queue
//!
//! Fixed-capacity FIFO shared between threads. Used for a Maatine's ready
//! queue of Works and as the buffer of channels. Operations never block:
//! a full queue reports [`MaatError::QueueFull`], an empty one `None`.

use crate::{MaatError, MaatResult};
use parking_lot::Mutex;

struct Ring<T> {
    buf: Box<[Option<T>]>,
    head: usize,
    len: usize,
    closed: bool,
}

/// Thread-safe bounded FIFO
pub struct RingQueue<T> {
    inner: Mutex<Ring<T>>,
}

impl<T> RingQueue<T> {
    /// Queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Ring {
                buf: (0..capacity).map(|_| None).collect(),
                head: 0,
                len: 0,
                closed: false,
            }),
        }
    }

    /// Append `item`
    ///
    /// Fails with [`MaatError::ChannelClosed`] once closed and with
    /// [`MaatError::QueueFull`] when no slot is free.
    pub fn try_push(&self, item: T) -> MaatResult<()> {
        let mut ring = self.inner.lock();
        if ring.closed {
            return Err(MaatError::ChannelClosed);
        }
        let capacity = ring.buf.len();
        if ring.len == capacity {
            return Err(MaatError::QueueFull);
        }
        let tail = (ring.head + ring.len) % capacity;
        ring.buf[tail] = Some(item);
        ring.len += 1;
        Ok(())
    }

    /// Remove the oldest item
    pub fn try_pop(&self) -> Option<T> {
        let mut ring = self.inner.lock();
        if ring.len == 0 {
            return None;
        }
        let head = ring.head;
        let item = ring.buf[head].take();
        ring.head = (head + 1) % ring.buf.len();
        ring.len -= 1;
        item
    }

    /// Refuse further pushes; queued items can still be popped
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Drop every queued item
    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.buf.iter_mut().for_each(|slot| *slot = None);
        ring.head = 0;
        ring.len = 0;
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items
    pub fn capacity(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// Visit the queued items, oldest first
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        let ring = self.inner.lock();
        let capacity = ring.buf.len();
        for i in 0..ring.len {
            if let Some(item) = &ring.buf[(ring.head + i) % capacity] {
                f(item);
            }
        }
    }
}

impl<T> std::fmt::Debug for RingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.inner.lock();
        f.debug_struct("RingQueue")
            .field("len", &ring.len)
            .field("capacity", &ring.buf.len())
            .field("closed", &ring.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_wraps_around() {
        let q = RingQueue::new(3);
        for round in 0..5 {
            q.try_push(round * 2).unwrap();
            q.try_push(round * 2 + 1).unwrap();
            assert_eq!(q.try_pop(), Some(round * 2));
            assert_eq!(q.try_pop(), Some(round * 2 + 1));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_full_and_closed() {
        let q = RingQueue::new(2);
        q.try_push(1).unwrap();
        q.try_push(2).unwrap();
        assert!(matches!(q.try_push(3), Err(MaatError::QueueFull)));
        q.close();
        assert!(matches!(q.try_push(3), Err(MaatError::ChannelClosed)));
        assert_eq!(q.try_pop(), Some(1));
        let mut rest = Vec::new();
        q.for_each(|v| rest.push(*v));
        assert_eq!(rest, vec![2]);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;
        let q = Arc::new(RingQueue::new(4000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        q.try_push(t * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = Vec::new();
        while let Some(v) = q.try_pop() {
            seen.push(v);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..4000).collect::<Vec<_>>());
    }
}
