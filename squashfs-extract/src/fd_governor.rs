//! Bounded count of simultaneously open output files (spec.md §4.9).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Condvar, Mutex};

struct Inner {
    open_count: usize,
}

/// Purely a counting admission gate; no LRU of file descriptors. Matches
/// original_source's `open_init`/`open_wait`/`close_wake`.
pub struct OpenFdGovernor {
    inner: Mutex<Inner>,
    cond: Condvar,
    max_open: Option<usize>,
}

impl OpenFdGovernor {
    /// `max_open = None` means unlimited (original_source's `open_unlimited`).
    pub fn new(max_open: Option<usize>) -> Self {
        Self { inner: Mutex::new(Inner { open_count: 0 }), cond: Condvar::new(), max_open }
    }

    /// Computes `max_open` from the process's `RLIMIT_NOFILE`, minus a
    /// safety margin, the way original_source derives it from `getrlimit`.
    #[cfg(unix)]
    pub fn from_rlimit(margin: usize) -> Self {
        let mut rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        let max_open = unsafe {
            if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0 {
                if rlim.rlim_cur == libc::RLIM_INFINITY {
                    None
                } else {
                    Some((rlim.rlim_cur as usize).saturating_sub(margin).max(1))
                }
            } else {
                None
            }
        };
        Self::new(max_open)
    }

    /// Blocks until a slot is free, then opens `path` with `options`.
    pub fn open_wait(&self, path: &Path, options: &OpenOptions) -> io::Result<File> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(max) = self.max_open {
            while inner.open_count >= max {
                inner = self.cond.wait(inner).unwrap();
            }
        }
        inner.open_count += 1;
        drop(inner);
        match options.open(path) {
            Ok(f) => Ok(f),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Releases a slot without closing anything; used when `open_wait`
    /// itself failed after the slot was reserved.
    fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.open_count = inner.open_count.saturating_sub(1);
        drop(inner);
        self.cond.notify_one();
    }

    /// Drops `file` (closing the fd) and releases its slot.
    pub fn close_wake(&self, file: File) {
        drop(file);
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn blocks_until_a_slot_frees() {
        let gov = Arc::new(OpenFdGovernor::new(Some(1)));
        let dir = tempdir().unwrap();

        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        let f1 = gov.open_wait(&dir.path().join("a"), &opts).unwrap();

        let gov2 = gov.clone();
        let dir_path = dir.path().join("b");
        let handle = thread::spawn(move || {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            gov2.open_wait(&dir_path, &opts).unwrap();
        });

        thread::sleep(std::time::Duration::from_millis(20));
        gov.close_wake(f1);
        handle.join().unwrap();
    }
}
