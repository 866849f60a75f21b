//! Superblock-version dispatch.
//!
//! Multi-version dispatch (v1/v2/v3/v4) is expressed, per design notes §9,
//! as a small capability trait rather than a version-tagged enum; v4 (in
//! [`v4`]) is the only implementation this crate ships, but a legacy reader
//! can plug in by implementing [`FormatOps`] itself.

pub mod v4;

use crate::dir::{entry_kind, EntryKind};
use crate::error::Result;
use crate::inode::Inode;
use crate::metadata::MetadataCursor;
use crate::superblock::SuperBlock;

/// One directory entry with its inode cursor already resolved from the
/// entry's `(header.start_block, entry.offset)` pair — the per-header
/// `start_block` a listing may carry several of is folded in here so
/// callers never need to track it themselves.
pub struct ResolvedEntry {
    pub name: Vec<u8>,
    pub inode_cursor: MetadataCursor,
    t: u16,
}

impl ResolvedEntry {
    pub fn kind(&self) -> Option<EntryKind> {
        entry_kind(self.t)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind(), Some(EntryKind::Dir | EntryKind::ExtendedDir))
    }
}

/// One resolved directory listing (spec.md §4.6's `(Dir, InodeOfThatDir)`).
pub struct OpenDir {
    pub entries: Vec<ResolvedEntry>,
}

/// The capability set a SquashFS reader of any on-disk version must
/// provide to drive `Traversal`.
pub trait FormatOps: Send + Sync {
    /// `cursor` is the directory inode's own `(block_index, block_offset)`;
    /// `byte_size` is the directory's listing length after subtracting the
    /// on-disk format's `+3` quirk (see `DirView::listing_len`).
    fn root_cursor(&self) -> MetadataCursor;
    fn open_dir(&self, cursor: MetadataCursor, byte_size: usize) -> Result<OpenDir>;
    fn read_inode(&self, cursor: MetadataCursor) -> Result<Inode>;
    /// `(start offset, on-disk size, compressed)` for fragment `idx`.
    fn read_fragment(&self, idx: u32) -> Result<(u64, u32, bool)>;
    fn stat(&self) -> &SuperBlock;
    fn uid(&self, idx: u16) -> u32;
    fn gid(&self, idx: u16) -> u32;
}
