//! The reader / inflator / writer thread pipeline (spec.md §4.5,
//! original_source's `reader()`/`inflator()`/`writer()`).

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, instrument, warn};

use crate::attrs::{self, Attrs};
use crate::block_cache::{BlockCache, CacheEntry};
use crate::block_io::{BlockIo, BufReadSeek};
use crate::compressor::Compressor;
use crate::error::Result;
use crate::fd_governor::OpenFdGovernor;
use crate::queue::Queue;

/// Work handed to the writer thread. A `FileHeader` is always followed by
/// exactly `blocks` `Block` items on the same queue before the next header,
/// mirroring original_source's single `to_writer` stream.
pub enum WriterItem {
    FileHeader(FileHeader),
    Block(BlockItem),
    DirAttrs(DirAttrsItem),
}

pub struct FileHeader {
    pub fd: File,
    pub path: PathBuf,
    pub blocks: usize,
    pub file_size: u64,
    /// Whether holes in this file should be created with `lseek` rather
    /// than zero-filled (the CLI's sparse-files switch).
    pub sparse_output: bool,
    pub attrs: Attrs,
}

pub struct BlockItem {
    /// `None` marks a sparse (hole) block; `size` is then the hole's byte
    /// length rather than a buffer slice length.
    pub entry: Option<Arc<CacheEntry>>,
    /// The cache `entry` was checked out from, so the writer can release it
    /// back once the block has been written.
    pub cache: Option<Arc<BlockCache>>,
    pub offset: usize,
    pub size: usize,
}

pub struct DirAttrsItem {
    pub path: PathBuf,
    pub attrs: Attrs,
}

/// Wires together the bounded queues, the two block caches (data and
/// fragment), the reader thread, the rayon inflator pool, and the writer
/// thread.
pub struct Pipeline {
    to_reader: Arc<Queue<Arc<CacheEntry>>>,
    to_inflate: Arc<Queue<Arc<CacheEntry>>>,
    to_writer: Arc<Queue<WriterItem>>,
    pub data_cache: Arc<BlockCache>,
    pub fragment_cache: Arc<BlockCache>,
    fd_governor: Arc<OpenFdGovernor>,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<bool>>,
    inflate_pool: rayon::ThreadPool,
    running_as_root: bool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R>(
        block_io: Arc<BlockIo<R>>,
        compressor: Compressor,
        block_size: u32,
        data_buffers: usize,
        frag_buffers: usize,
        n_inflators: usize,
        writer_queue_capacity: usize,
        fd_governor: Arc<OpenFdGovernor>,
        running_as_root: bool,
        strict_errors: bool,
    ) -> Self
    where
        R: BufReadSeek + 'static,
    {
        let to_reader = Arc::new(Queue::new(data_buffers.max(1) + frag_buffers.max(1)));
        let to_inflate: Arc<Queue<Arc<CacheEntry>>> = Arc::new(Queue::new(data_buffers.max(1) + frag_buffers.max(1)));
        let to_writer = Arc::new(Queue::new(writer_queue_capacity.max(1)));

        let data_cache = Arc::new(BlockCache::new(block_size, data_buffers.max(1), to_reader.clone()));
        let fragment_cache = Arc::new(BlockCache::new(block_size, frag_buffers.max(1), to_reader.clone()));

        let reader_handle = {
            let to_reader = to_reader.clone();
            let to_inflate = to_inflate.clone();
            let block_io = block_io.clone();
            Some(
                thread::Builder::new()
                    .name("squashfs-reader".into())
                    .spawn(move || reader_loop(&to_reader, &to_inflate, &block_io))
                    .expect("spawn reader thread"),
            )
        };

        let inflate_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_inflators.max(1))
            .thread_name(|i| format!("squashfs-inflate-{i}"))
            .build()
            .expect("build inflator pool");
        for _ in 0..n_inflators.max(1) {
            let to_inflate = to_inflate.clone();
            let block_size = block_size as usize;
            let compressor = compressor;
            inflate_pool.spawn(move || inflate_loop(&to_inflate, block_size, compressor));
        }

        let lseek_broken = Arc::new(AtomicBool::new(false));
        let writer_handle = {
            let to_writer = to_writer.clone();
            let fd_governor = fd_governor.clone();
            let lseek_broken = lseek_broken.clone();
            Some(
                thread::Builder::new()
                    .name("squashfs-writer".into())
                    .spawn(move || {
                        writer_loop(&to_writer, &fd_governor, &lseek_broken, running_as_root, strict_errors)
                    })
                    .expect("spawn writer thread"),
            )
        };

        Self {
            to_reader,
            to_inflate,
            to_writer,
            data_cache,
            fragment_cache,
            fd_governor,
            reader_handle,
            writer_handle,
            inflate_pool,
            running_as_root,
        }
    }

    pub fn queue_file_header(&self, header: FileHeader) {
        self.to_writer.put(WriterItem::FileHeader(header));
    }

    pub fn queue_block(&self, block: BlockItem) {
        self.to_writer.put(WriterItem::Block(block));
    }

    pub fn queue_dir_attrs(&self, item: DirAttrsItem) {
        self.to_writer.put(WriterItem::DirAttrs(item));
    }

    pub fn open_output(&self, path: &std::path::Path) -> io::Result<File> {
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        self.fd_governor.open_wait(path, &opts)
    }

    pub fn running_as_root(&self) -> bool {
        self.running_as_root
    }

    /// Closes every queue and waits for the reader, inflator pool and
    /// writer to drain. Returns whether the writer observed any failure.
    pub fn shutdown(mut self) -> bool {
        // By the time shutdown runs, the traversal has already finished
        // queuing every block it will ever queue, so closing `to_reader` now
        // is safe: `reader_loop`'s `while let Some(..) = to_reader.get()`
        // drains whatever's left, then sees closed+empty and returns.
        self.to_reader.close();
        if let Some(h) = self.reader_handle.take() {
            let _ = h.join();
        }
        // Only close `to_inflate` once the reader is known to have stopped
        // pushing to it — `Queue::get()` returns `None` as soon as it finds
        // the queue closed *and* empty, so closing it earlier risks an
        // inflate thread exiting on a momentary lull and leaving a
        // still-to-come entry with nobody to mark it ready.
        self.to_inflate.close();

        self.to_writer.close();
        if let Some(h) = self.writer_handle.take() {
            let _ = h.join();
        }
        // dropping `inflate_pool` blocks until queued closures return
        true
    }
}

#[instrument(skip_all)]
fn reader_loop<R: BufReadSeek>(
    to_reader: &Queue<Arc<CacheEntry>>,
    to_inflate: &Queue<Arc<CacheEntry>>,
    block_io: &BlockIo<R>,
) {
    while let Some(entry) = to_reader.get() {
        let mut buffer = entry.buffer.lock().unwrap();
        if buffer.len() < entry.on_disk_size as usize {
            buffer.resize(entry.on_disk_size as usize, 0);
        }
        let res = block_io.read_at(entry.block_offset, &mut buffer[..entry.on_disk_size as usize]);
        drop(buffer);

        match res {
            Ok(()) if entry.compressed => to_inflate.put(entry.clone()),
            Ok(()) => entry.ready(false),
            Err(e) => {
                error!(block_offset = entry.block_offset, %e, "block read failed");
                entry.ready(true);
            }
        }
    }
}

#[instrument(skip_all)]
fn inflate_loop(to_inflate: &Queue<Arc<CacheEntry>>, block_size: usize, compressor: Compressor) {
    let mut scratch = vec![0u8; block_size];
    while let Some(entry) = to_inflate.get() {
        let mut buffer = entry.buffer.lock().unwrap();
        let on_disk = entry.on_disk_size as usize;
        let res = crate::compressor::decompress(&buffer[..on_disk], &mut scratch, compressor);
        match res {
            Ok(n) => {
                buffer[..n].copy_from_slice(&scratch[..n]);
                drop(buffer);
                entry.ready(false);
            }
            Err(e) => {
                drop(buffer);
                error!(block_offset = entry.block_offset, %e, "decompress failed");
                entry.ready(true);
            }
        }
    }
}

/// Writes `size` bytes of `buffer` to `file` at the current position,
/// first materialising a `hole`-byte gap either with `lseek` (when
/// `sparse_output` and the seek hasn't previously failed) or by writing
/// explicit zero blocks. Mirrors original_source's `write_block`.
fn write_block(
    file: &mut File,
    buffer: &[u8],
    hole: u64,
    sparse_output: bool,
    lseek_broken: &AtomicBool,
    block_size: usize,
) -> io::Result<()> {
    if hole > 0 {
        let mut seeked = false;
        if sparse_output && !lseek_broken.load(Ordering::Relaxed) {
            match file.seek(SeekFrom::Current(hole as i64)) {
                Ok(_) => seeked = true,
                Err(_) => lseek_broken.store(true, Ordering::Relaxed),
            }
        }
        if !seeked {
            let zero = vec![0u8; block_size];
            let mut remaining = hole;
            while remaining > 0 {
                let take = remaining.min(block_size as u64) as usize;
                file.write_all(&zero[..take])?;
                remaining -= take as u64;
            }
        }
    }
    file.write_all(buffer)
}

#[instrument(skip_all)]
fn writer_loop(
    to_writer: &Queue<WriterItem>,
    fd_governor: &OpenFdGovernor,
    lseek_broken: &AtomicBool,
    running_as_root: bool,
    strict_errors: bool,
) -> bool {
    let mut exit_code = false;

    while let Some(item) = to_writer.get() {
        match item {
            WriterItem::DirAttrs(DirAttrsItem { path, attrs }) => {
                if attrs::set_attributes(&path, attrs, false, running_as_root, strict_errors).is_err() {
                    exit_code = true;
                    if strict_errors {
                        break;
                    }
                }
            }
            WriterItem::Block(_) => {
                // A bare block with no preceding header indicates a caller
                // bug; nothing to do but drop it.
                warn!("writer: block with no active file header, dropping");
            }
            WriterItem::FileHeader(FileHeader { mut fd, path, blocks, file_size, sparse_output, attrs }) => {
                let mut hole: u64 = 0;
                let mut local_fail = false;

                for _ in 0..blocks {
                    let Some(next) = to_writer.get() else { break };
                    let WriterItem::Block(block) = next else {
                        warn!("writer: expected Block item, got something else");
                        local_fail = true;
                        continue;
                    };

                    match block.entry {
                        None => hole += block.size as u64,
                        Some(entry) => {
                            let errored = entry.wait();
                            if errored {
                                warn!(path = %path.display(), "read/decompress failure for file");
                                exit_code = true;
                                local_fail = true;
                            }
                            if !local_fail {
                                let buffer = entry.buffer.lock().unwrap();
                                let slice = &buffer[block.offset..block.offset + block.size];
                                if let Err(e) =
                                    write_block(&mut fd, slice, hole, sparse_output, lseek_broken, 1 << 20)
                                {
                                    warn!(path = %path.display(), %e, "write failed");
                                    exit_code = true;
                                    local_fail = true;
                                }
                            }
                            hole = 0;
                            if let Some(cache) = &block.cache {
                                cache.put(&entry);
                            }
                            drop(entry);
                        }
                    }
                }

                if hole > 0 && !local_fail {
                    if !sparse_output || fd.seek(SeekFrom::Current(hole as i64 - 1)).is_err() {
                        let res =
                            write_block(&mut fd, &[0u8], hole - 1, sparse_output, lseek_broken, 1 << 20);
                        if res.is_err() {
                            exit_code = true;
                            local_fail = true;
                        }
                    } else if let Err(e) = fd.set_len(file_size) {
                        warn!(path = %path.display(), %e, "ftruncate failed for trailing hole");
                        exit_code = true;
                        local_fail = true;
                    }
                }

                fd_governor.close_wake(fd);

                if local_fail {
                    let _ = std::fs::remove_file(&path);
                } else if attrs::set_attributes(&path, attrs, true, running_as_root, strict_errors).is_err() {
                    exit_code = true;
                    if strict_errors {
                        break;
                    }
                }
            }
        }
    }

    exit_code
}

