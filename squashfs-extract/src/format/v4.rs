//! v4 on-disk format: superblock, inode, directory and fragment-table
//! decoding (spec.md §4.6).

use deku::prelude::*;
use tracing::instrument;

use crate::block_io::{BlockIo, BufReadSeek};
use crate::error::{Error, Result};
use crate::fragment::{Fragment, FRAGMENT_SIZE};
use crate::id::Id;
use crate::inode::Inode;
use crate::metadata::{MetadataCursor, MetadataStore};
use crate::superblock::{SuperBlock, METADATA_MAXSIZE, NOT_SET};

use super::{FormatOps, OpenDir, ResolvedEntry};

/// A fully-opened v4 image: superblock plus the tables needed to drive
/// extraction.
pub struct SquashfsV4<'a, R> {
    superblock: SuperBlock,
    block_io: &'a BlockIo<R>,
    inode_store: MetadataStore<'a, R>,
    dir_store: MetadataStore<'a, R>,
    fragments: Vec<Fragment>,
    ids: Vec<Id>,
}

impl<'a, R: BufReadSeek> SquashfsV4<'a, R> {
    #[instrument(skip(block_io))]
    pub fn open(block_io: &'a BlockIo<R>) -> Result<Self> {
        let mut raw = [0u8; 96];
        block_io.read_at(0, &mut raw)?;
        let (_, superblock) = SuperBlock::from_bytes((&raw, 0))?;
        superblock.validate()?;

        if superblock.compressor_options_are_present() {
            // Compression-options metadata block immediately follows the
            // superblock; we don't need its contents (no encoder here),
            // but the decompressors never consult it so skipping is safe.
        }

        let check_data = false; // v4 images in this design never set SQUASHFS_CHECK; kept for symmetry
        let inode_store = MetadataStore::new(block_io, superblock.compressor, check_data);
        let dir_store = MetadataStore::new(block_io, superblock.compressor, check_data);

        let fragments = if superblock.frag_count == 0 || superblock.frag_table == NOT_SET {
            Vec::new()
        } else {
            read_indexed_table::<Fragment, R>(
                block_io,
                superblock.compressor,
                superblock.frag_table,
                superblock.frag_count as usize,
                FRAGMENT_SIZE,
            )?
        };

        let ids = if superblock.id_count == 0 {
            Vec::new()
        } else {
            read_indexed_table::<Id, R>(
                block_io,
                superblock.compressor,
                superblock.id_table,
                superblock.id_count as usize,
                Id::SIZE,
            )?
        };

        Ok(Self { superblock, block_io, inode_store, dir_store, fragments, ids })
    }

    pub fn root_cursor(&self) -> MetadataCursor {
        let (start, offset) = self.superblock.root_inode_location();
        MetadataCursor::new(self.superblock.inode_table + start, offset as usize)
    }
}

/// Reads an indexed table (id/fragment/export): a raw array of `u64`
/// metadata-block offsets stored at `table_ptr`, each block holding as
/// many fixed-size entries as fit in 8 KiB, concatenated to `count` total
/// entries of `entry_size` bytes.
fn read_indexed_table<T, R>(
    block_io: &BlockIo<R>,
    compressor: crate::compressor::Compressor,
    table_ptr: u64,
    count: usize,
    entry_size: usize,
) -> Result<Vec<T>>
where
    T: for<'d> DekuContainerRead<'d>,
    R: BufReadSeek,
{
    let per_block = METADATA_MAXSIZE / entry_size;
    let block_count = count.div_ceil(per_block);

    let mut index = vec![0u8; block_count * 8];
    block_io.read_at(table_ptr, &mut index)?;

    let store = MetadataStore::new(block_io, compressor, false);
    let mut bytes = Vec::with_capacity(count * entry_size);
    for chunk in index.chunks_exact(8) {
        let block_offset = u64::from_le_bytes(chunk.try_into().unwrap());
        let remaining_entries = count - bytes.len() / entry_size;
        let mut payload = vec![0u8; per_block.min(remaining_entries) * entry_size];
        store.read(MetadataCursor::new(block_offset, 0), &mut payload)?;
        bytes.extend_from_slice(&payload);
    }
    bytes.truncate(count * entry_size);

    let mut out = Vec::with_capacity(count);
    let mut rest = &bytes[..];
    for _ in 0..count {
        let ((new_rest, _), value) = T::from_bytes((rest, 0))?;
        out.push(value);
        rest = new_rest;
    }
    Ok(out)
}

impl<'a, R: BufReadSeek> FormatOps for SquashfsV4<'a, R> {
    fn root_cursor(&self) -> MetadataCursor {
        SquashfsV4::root_cursor(self)
    }

    #[instrument(skip(self))]
    fn open_dir(&self, cursor: MetadataCursor, byte_size: usize) -> Result<OpenDir> {
        // A directory listing is one or more `(header, entries[])` runs,
        // each header free to name a different inode-table `start_block`
        // (SQUASHFS_DIR_ENTRIES in the original format caps entries per
        // header at 256, forcing a new header for larger directories).
        // We stop once `byte_size` on-disk bytes have been consumed, the
        // same accounting original_source's `squashfs_opendir` uses.
        let mut entries = Vec::new();
        let mut consumed = 0usize;
        let mut at = cursor;

        while consumed < byte_size {
            let mut header = [0u8; 12];
            at = self.dir_store.read(at, &mut header)?;
            consumed += header.len();
            let count = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let start_block = u32::from_le_bytes(header[4..8].try_into().unwrap());

            for _ in 0..=count {
                let mut row_head = [0u8; 8];
                at = self.dir_store.read(at, &mut row_head)?;
                let row_offset = u16::from_le_bytes(row_head[0..2].try_into().unwrap());
                let t = u16::from_le_bytes(row_head[4..6].try_into().unwrap());
                let name_size = u16::from_le_bytes(row_head[6..8].try_into().unwrap());
                let mut name = vec![0u8; name_size as usize + 1];
                at = self.dir_store.read(at, &mut name)?;
                consumed += row_head.len() + name.len();

                let inode_cursor = MetadataCursor::new(
                    self.superblock.inode_table + start_block as u64,
                    row_offset as usize,
                );
                entries.push(ResolvedEntry { name, inode_cursor, t });
            }
        }
        Ok(OpenDir { entries })
    }

    #[instrument(skip(self))]
    fn read_inode(&self, cursor: MetadataCursor) -> Result<Inode> {
        // Inodes are variably sized; over-read a window, decode, and trust
        // deku to stop at the right byte (mirrors teacher's `root_inode`
        // two-block-stitch approach, generalised to any size). The first
        // window is exactly what's left in the inode's own block: reading
        // past that would force `MetadataStore::read` to cross into
        // whatever metadata happens to follow even when the inode never
        // needed it. Only widen to a second block's worth if that proved
        // too little (an inode straddling a block boundary).
        let ctx = (self.superblock.block_size, self.superblock.block_log);
        let in_block = self.inode_store.available_in_block(cursor)?;
        let mut last_err = None;
        for window in [in_block, in_block + METADATA_MAXSIZE] {
            let mut buf = vec![0u8; window];
            match self.inode_store.read(cursor, &mut buf) {
                Ok(_) => match Inode::from_bytes((&buf, 0), ctx) {
                    Ok((_, inode)) => return Ok(inode),
                    Err(e) => last_err = Some(Error::Deku(e)),
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(Error::UnexpectedEof))
    }

    fn read_fragment(&self, idx: u32) -> Result<(u64, u32, bool)> {
        let frag = self
            .fragments
            .get(idx as usize)
            .ok_or_else(|| Error::CorruptFormat(format!("fragment index {idx} out of range")))?;
        let (compressed, size) = frag.compressed_size();
        Ok((frag.start, size, compressed))
    }

    fn stat(&self) -> &SuperBlock {
        &self.superblock
    }

    fn uid(&self, idx: u16) -> u32 {
        self.ids.get(idx as usize).map(|i| i.0).unwrap_or(0)
    }

    fn gid(&self, idx: u16) -> u32 {
        self.ids.get(idx as usize).map(|i| i.0).unwrap_or(0)
    }
}
