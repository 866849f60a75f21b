//! Bounded cache of pending/ready data and fragment blocks, with hash
//! lookup and free-list reuse (spec.md §4.3, design notes §9).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use tracing::trace;

use crate::queue::Queue;

struct EntryState {
    pending: bool,
    error: bool,
    used: u32,
}

/// `(block_offset, on_disk_size, compressed_flag)`, a buffer of
/// `block_size` bytes, and the pending/error/refcount bookkeeping spec.md
/// names. Handed around as `Arc<CacheEntry>` so the reader, inflator and
/// writer threads can all hold a reference to the same buffer.
pub struct CacheEntry {
    pub block_offset: u64,
    pub on_disk_size: u32,
    pub compressed: bool,
    pub buffer: Mutex<Vec<u8>>,
    state: Mutex<EntryState>,
    ready_cond: Condvar,
}

impl CacheEntry {
    fn new(block_offset: u64, on_disk_size: u32, compressed: bool, block_size: u32) -> Self {
        Self {
            block_offset,
            on_disk_size,
            compressed,
            buffer: Mutex::new(vec![0u8; block_size as usize]),
            state: Mutex::new(EntryState { pending: true, error: false, used: 1 }),
            ready_cond: Condvar::new(),
        }
    }

    /// Marks the entry ready, latching `error` and waking every waiter.
    /// Must be called exactly once per `get` (spec.md §4.3, §5).
    pub fn ready(&self, error: bool) {
        let mut state = self.state.lock().unwrap();
        state.pending = false;
        state.error = error;
        self.ready_cond.notify_all();
    }

    /// Blocks until `ready` has been called; returns whether the block
    /// errored.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.pending {
            state = self.ready_cond.wait(state).unwrap();
        }
        state.error
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().pending
    }
}

struct Inner {
    hash: HashMap<u64, Arc<CacheEntry>>,
    free_list: VecDeque<Arc<CacheEntry>>,
    count: usize,
}

/// Configuration: `block_size` bytes per buffer, `max_buffers` capacity.
pub struct BlockCache {
    inner: Mutex<Inner>,
    free_available: Condvar,
    block_size: u32,
    max_buffers: usize,
    to_reader: Arc<Queue<Arc<CacheEntry>>>,
}

impl BlockCache {
    pub fn new(block_size: u32, max_buffers: usize, to_reader: Arc<Queue<Arc<CacheEntry>>>) -> Self {
        Self {
            inner: Mutex::new(Inner { hash: HashMap::new(), free_list: VecDeque::new(), count: 0 }),
            free_available: Condvar::new(),
            block_size,
            max_buffers,
            to_reader,
        }
    }

    /// Look up or create the cache entry for `block_offset`, enqueueing a
    /// read request to the reader when (and only when) the buffer isn't
    /// already valid.
    pub fn get(&self, block_offset: u64, on_disk_size: u32, compressed: bool) -> Arc<CacheEntry> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.hash.get(&block_offset) {
            let mut state = existing.state.lock().unwrap();
            if state.used == 0 {
                // hash hit on a free-but-not-yet-evicted entry: reuse the
                // still-valid buffer, do NOT re-enqueue a read.
                inner.free_list.retain(|e| !Arc::ptr_eq(e, existing));
            }
            state.used += 1;
            drop(state);
            return existing.clone();
        }

        let entry = if inner.count < self.max_buffers {
            inner.count += 1;
            Arc::new(CacheEntry::new(block_offset, on_disk_size, compressed, self.block_size))
        } else {
            while inner.free_list.is_empty() {
                inner = self.free_available.wait(inner).unwrap();
            }
            let reused = inner.free_list.pop_front().unwrap();
            let old_key = reused.block_offset;
            inner.hash.remove(&old_key);
            Arc::new(CacheEntry::new(block_offset, on_disk_size, compressed, self.block_size))
        };

        inner.hash.insert(block_offset, entry.clone());
        trace!(block_offset, "enqueueing block read");
        self.to_reader.put(entry.clone());
        entry
    }

    /// Releases a reference; once it reaches zero the buffer becomes
    /// eligible for eviction (moved to the free-list tail) but stays
    /// hash-reachable until some other key takes its slot.
    pub fn put(&self, entry: &Arc<CacheEntry>) {
        let mut state = entry.state.lock().unwrap();
        state.used -= 1;
        let now_free = state.used == 0;
        drop(state);
        if now_free {
            let mut inner = self.inner.lock().unwrap();
            inner.free_list.push_back(entry.clone());
            self.free_available.notify_one();
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_never_exceeded() {
        let to_reader = Arc::new(Queue::new(16));
        let cache = BlockCache::new(4096, 2, to_reader.clone());

        let a = cache.get(0, 4096, false);
        let b = cache.get(4096, 4096, false);
        assert_eq!(cache.live_count(), 2);

        cache.put(&a);
        cache.put(&b);

        // third distinct key must reuse, not grow past max_buffers
        let _c = cache.get(8192, 4096, false);
        assert_eq!(cache.live_count(), 2);
    }

    #[test]
    fn re_get_of_freed_but_not_evicted_entry_does_not_reread() {
        let to_reader = Arc::new(Queue::new(16));
        let cache = BlockCache::new(4096, 2, to_reader.clone());

        let a = cache.get(0, 4096, false);
        assert_eq!(to_reader.len(), 1);
        a.ready(false);
        cache.put(&a);

        // consume the one read request so the queue is observably empty
        to_reader.get().unwrap();

        let a2 = cache.get(0, 4096, false);
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(to_reader.is_empty());
        assert!(!a2.is_pending());
    }

    #[test]
    fn used_zero_iff_on_free_list() {
        let to_reader = Arc::new(Queue::new(16));
        let cache = BlockCache::new(4096, 1, to_reader);
        let a = cache.get(0, 4096, false);
        assert_eq!(a.state.lock().unwrap().used, 1);
        cache.put(&a);
        assert_eq!(a.state.lock().unwrap().used, 0);
    }
}
