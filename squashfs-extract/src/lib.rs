//! Read, list and extract SquashFS v4 filesystem images.
//!
//! The entry point is [`extract`]: it opens a backing reader as a v4 image,
//! walks its directory tree twice (a size-only pre-scan, then the real
//! extraction pass) and drives a bounded reader/inflator/writer pipeline to
//! reconstruct files, symlinks, device nodes and hardlinks on disk.

pub mod attrs;
pub mod block_cache;
pub mod block_io;
pub mod compressor;
pub mod dir;
pub mod error;
pub mod fd_governor;
pub mod format;
pub mod fragment;
pub mod id;
pub mod inode;
pub mod metadata;
pub mod path_filter;
pub mod pipeline;
pub mod queue;
pub mod superblock;
pub mod traversal;

pub use error::{Error, Result};

use std::path::PathBuf;
use std::sync::Arc;

use crate::block_io::{BlockIo, BufReadSeek};
use crate::fd_governor::OpenFdGovernor;
use crate::format::v4::SquashfsV4;
use crate::format::FormatOps;
use crate::path_filter::PathFilter;
use crate::pipeline::Pipeline;
use crate::superblock::SuperBlock;
use crate::traversal::{Traversal, TraversalOptions};

/// Tunables for a single [`extract`] run; defaults mirror original_source's
/// defaults (no depth limit, sparse files on, one inflator per core).
pub struct ExtractOptions {
    pub dest: PathBuf,
    pub force: bool,
    pub max_depth: Option<u32>,
    pub sparse_output: bool,
    pub list_only: bool,
    pub data_buffers: usize,
    pub frag_buffers: usize,
    pub processors: usize,
    pub writer_queue_capacity: usize,
    pub max_open_files: Option<usize>,
    pub offset: u64,
    pub path_filter: PathFilter,
    /// Escalates a per-entry creation failure into an aborted extraction.
    pub strict_errors: bool,
    /// Suppresses per-entry failure logging; the entry is still skipped.
    pub ignore_errors: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        let processors = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            dest: PathBuf::from("squashfs-root"),
            force: false,
            max_depth: None,
            sparse_output: true,
            list_only: false,
            data_buffers: 64,
            frag_buffers: 3,
            processors,
            writer_queue_capacity: 64,
            max_open_files: None,
            offset: 0,
            path_filter: PathFilter::new(),
            strict_errors: false,
            ignore_errors: false,
        }
    }
}

/// Per-kind creation counts plus whether any non-fatal error was observed
/// along the way (a file that failed to extract does not abort the walk).
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractReport {
    pub files_created: u64,
    pub dirs_created: u64,
    pub symlinks_created: u64,
    pub devices_created: u64,
    pub had_errors: bool,
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// Opens `reader` as a SquashFS v4 image (starting `options.offset` bytes
/// in, for images embedded in a larger blob) and extracts it under
/// `options.dest`.
pub fn extract<R>(reader: R, options: ExtractOptions) -> Result<ExtractReport>
where
    R: BufReadSeek + 'static,
{
    let block_io = Arc::new(BlockIo::new(reader, options.offset));
    let format = SquashfsV4::open(&block_io)?;
    let superblock = *format.stat();

    let fd_governor = Arc::new(match options.max_open_files {
        Some(n) => OpenFdGovernor::new(Some(n)),
        None => open_fd_governor(),
    });

    let running_as_root = running_as_root();
    let pipeline = Pipeline::new(
        block_io.clone(),
        superblock.compressor,
        superblock.block_size,
        options.data_buffers,
        options.frag_buffers,
        options.processors,
        options.writer_queue_capacity,
        fd_governor,
        running_as_root,
        options.strict_errors,
    );

    let extract_roots = options.path_filter.extract_roots();
    let exclude_roots = options.path_filter.exclude_roots();

    let traversal_options = TraversalOptions {
        force: options.force,
        max_depth: options.max_depth,
        sparse_output: options.sparse_output,
        list_only: options.list_only,
        strict_errors: options.strict_errors,
        ignore_errors: options.ignore_errors,
    };
    let traversal = Traversal::new(&format, &pipeline, traversal_options);

    let root_cursor = format.root_cursor();
    let scan_result = traversal.dir_scan(&options.dest, root_cursor, extract_roots, exclude_roots, 0);

    let files_created = traversal.files_created();
    let dirs_created = traversal.dirs_created();
    let symlinks_created = traversal.symlinks_created();
    let devices_created = traversal.devices_created();

    let had_writer_errors = pipeline.shutdown();

    let report = ExtractReport {
        files_created,
        dirs_created,
        symlinks_created,
        devices_created,
        had_errors: had_writer_errors,
    };

    scan_result?;
    Ok(report)
}

/// Opens `reader` as a v4 image and returns its superblock, for `-stat`-style
/// inspection without running a full extraction.
pub fn stat<R>(reader: R, offset: u64) -> Result<SuperBlock>
where
    R: BufReadSeek + 'static,
{
    let block_io = BlockIo::new(reader, offset);
    let format = SquashfsV4::open(&block_io)?;
    Ok(*format.stat())
}

/// Resolves each of `paths` against the image's directory tree, following
/// symlinks along the way (`-L/-follow-symlinks`), and returns the union of
/// every canonical path reached, including intermediate symlinks
/// dereferenced to get there. `missing_symlinks_fatal` corresponds to
/// `-missing-symlinks`: when set, a path with an unresolved component is an
/// error instead of being silently dropped.
pub fn resolve_symlink_paths<R>(
    reader: R,
    offset: u64,
    paths: &[String],
    missing_symlinks_fatal: bool,
) -> Result<Vec<String>>
where
    R: BufReadSeek + 'static,
{
    let block_io = BlockIo::new(reader, offset);
    let format = SquashfsV4::open(&block_io)?;

    let mut resolved = Vec::new();
    for path in paths {
        resolved.extend(crate::traversal::follow_path(&format, path, missing_symlinks_fatal)?);
    }
    Ok(resolved)
}

#[cfg(unix)]
fn open_fd_governor() -> OpenFdGovernor {
    OpenFdGovernor::from_rlimit(16)
}

#[cfg(not(unix))]
fn open_fd_governor() -> OpenFdGovernor {
    OpenFdGovernor::new(None)
}
