//! Fixed-capacity, strict-FIFO multi-producer/multi-consumer handoff.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// A bounded ring buffer: `put` blocks while full, `get` blocks while
/// empty. Used to plumb reader -> inflator -> writer handoffs with a fixed
/// memory ceiling (spec.md §4.4).
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(Inner { items: VecDeque::with_capacity(capacity), capacity, closed: false }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Blocks until there is room, then pushes `item` to the tail.
    pub fn put(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= inner.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available, then pops it from the head.
    /// Returns `None` once the queue has been closed and drained.
    pub fn get(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Wakes every blocked `get`/`put` so shutdown can proceed without a
    /// sentinel value reaching every consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_is_preserved() {
        let q: Queue<i32> = Queue::new(4);
        for i in 0..4 {
            q.put(i);
        }
        for i in 0..4 {
            assert_eq!(q.get(), Some(i));
        }
    }

    #[test]
    fn put_blocks_until_room_then_get_drains_in_order() {
        let q = Arc::new(Queue::new(2));
        q.put(1);
        q.put(2);

        let q2 = q.clone();
        let handle = thread::spawn(move || {
            q2.put(3);
        });

        // give the producer a moment to actually block on the full queue
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(q.get(), Some(1));
        handle.join().unwrap();
        assert_eq!(q.get(), Some(2));
        assert_eq!(q.get(), Some(3));
    }

    #[test]
    fn close_wakes_blocked_get() {
        let q: Arc<Queue<i32>> = Arc::new(Queue::new(1));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.get());
        thread::sleep(std::time::Duration::from_millis(20));
        q.close();
        assert_eq!(handle.join().unwrap(), None);
    }
}
