//! Decompressed, content-addressed metadata caches (inode table, directory
//! table). Metadata blocks are immutable once materialised and keyed by
//! their absolute on-disk offset.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::block_io::BlockIo;
use crate::compressor::Compressor;
use crate::error::{Error, Result};
use crate::superblock::METADATA_MAXSIZE;

/// A logical position inside a metadata stream: which block, and how far
/// into its decompressed payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MetadataCursor {
    pub block_offset: u64,
    pub within_offset: usize,
}

impl MetadataCursor {
    pub fn new(block_offset: u64, within_offset: usize) -> Self {
        Self { block_offset, within_offset }
    }
}

struct MetadataBlock {
    data: Vec<u8>,
    next_index: u64,
}

/// One decompressed, content-addressed metadata cache keyed by on-disk
/// offset. The core is single-threaded for metadata, so materialisation is
/// not racy (spec.md §4.2): a plain `Mutex<HashMap>` suffices.
pub struct MetadataStore<'a, R> {
    io: &'a BlockIo<R>,
    blocks: Mutex<HashMap<u64, Arc<MetadataBlock>>>,
    compressor: Compressor,
    check_data: bool,
}

impl<'a, R: crate::block_io::BufReadSeek> MetadataStore<'a, R> {
    pub fn new(io: &'a BlockIo<R>, compressor: Compressor, check_data: bool) -> Self {
        Self { io, blocks: Mutex::new(HashMap::new()), compressor, check_data }
    }

    fn materialise(&self, block_offset: u64) -> Result<Arc<MetadataBlock>> {
        if let Some(existing) = self.blocks.lock().unwrap().get(&block_offset) {
            return Ok(existing.clone());
        }

        let mut header = [0u8; 2];
        self.io.read_at(block_offset, &mut header)?;
        let raw = u16::from_le_bytes(header);
        const COMPRESSED_BIT: u16 = 1 << 15;
        let compressed = raw & COMPRESSED_BIT == 0;
        let payload_len = (raw & !COMPRESSED_BIT) as usize;
        if payload_len > METADATA_MAXSIZE {
            return Err(Error::CorruptMetadata(format!(
                "metadata payload_len {payload_len} exceeds {METADATA_MAXSIZE}"
            )));
        }

        let header_len = if self.check_data { 3u64 } else { 2u64 };
        let mut payload = vec![0u8; payload_len];
        self.io.read_at(block_offset + 2, &mut payload)?;

        let data = if compressed {
            let mut out = vec![0u8; METADATA_MAXSIZE];
            let n = crate::compressor::decompress(&payload, &mut out, self.compressor)?;
            out.truncate(n);
            out
        } else {
            payload
        };

        if data.len() > METADATA_MAXSIZE {
            return Err(Error::CorruptMetadata("decompressed metadata block too large".into()));
        }

        let next_index = block_offset + header_len + payload_len as u64;
        let block = Arc::new(MetadataBlock { data, next_index });
        self.blocks.lock().unwrap().insert(block_offset, block.clone());
        trace!(block_offset, next_index, "materialised metadata block");
        Ok(block)
    }

    /// Read `dst.len()` bytes starting at `cursor`, returning the cursor
    /// advanced past them. Transparently crosses block boundaries.
    pub fn read(&self, mut cursor: MetadataCursor, dst: &mut [u8]) -> Result<MetadataCursor> {
        let mut written = 0;
        while written < dst.len() {
            let block = self.materialise(cursor.block_offset)?;
            if cursor.within_offset > block.data.len() {
                return Err(Error::CorruptMetadata("cursor past end of metadata block".into()));
            }
            let available = block.data.len() - cursor.within_offset;
            let take = available.min(dst.len() - written);
            dst[written..written + take]
                .copy_from_slice(&block.data[cursor.within_offset..cursor.within_offset + take]);
            written += take;
            cursor.within_offset += take;
            if cursor.within_offset == block.data.len() {
                cursor = MetadataCursor::new(block.next_index, 0);
            }
        }
        Ok(cursor)
    }

    pub fn read_u8(&self, cursor: MetadataCursor) -> Result<(u8, MetadataCursor)> {
        let mut buf = [0u8; 1];
        let next = self.read(cursor, &mut buf)?;
        Ok((buf[0], next))
    }

    /// Bytes left in `cursor`'s own block after `cursor.within_offset`,
    /// without following `next_index` into whatever comes after it. Lets a
    /// caller with a variably-sized record (an inode) read exactly what's
    /// available in the current block before deciding whether it needs to
    /// cross into the next one.
    pub fn available_in_block(&self, cursor: MetadataCursor) -> Result<usize> {
        let block = self.materialise(cursor.block_offset)?;
        if cursor.within_offset > block.data.len() {
            return Err(Error::CorruptMetadata("cursor past end of metadata block".into()));
        }
        Ok(block.data.len() - cursor.within_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_image(blocks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for b in blocks {
            let len = b.len() as u16 | (1 << 15); // uncompressed bit set
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(b);
        }
        out
    }

    #[test]
    fn reads_cross_block_boundaries() {
        let image = build_image(&[b"hello ", b"world!"]);
        let io = BlockIo::new(Cursor::new(image), 0);
        let store = MetadataStore::new(&io, Compressor::None, false);

        let mut dst = [0u8; 12];
        let cursor = MetadataCursor::new(0, 0);
        store.read(cursor, &mut dst).unwrap();
        assert_eq!(&dst, b"hello world!");
    }

    #[test]
    fn one_byte_reads_equal_one_bulk_read() {
        let image = build_image(&[b"abcdefgh"]);
        let io = BlockIo::new(Cursor::new(image.clone()), 0);
        let store = MetadataStore::new(&io, Compressor::None, false);
        let mut bulk = [0u8; 8];
        store.read(MetadataCursor::new(0, 0), &mut bulk).unwrap();

        let io2 = BlockIo::new(Cursor::new(image), 0);
        let store2 = MetadataStore::new(&io2, Compressor::None, false);
        let mut cursor = MetadataCursor::new(0, 0);
        let mut byte_by_byte = Vec::new();
        for _ in 0..8 {
            let (b, next) = store2.read_u8(cursor).unwrap();
            byte_by_byte.push(b);
            cursor = next;
        }
        assert_eq!(bulk.to_vec(), byte_by_byte);
    }

    #[test]
    fn oversized_payload_len_is_corrupt() {
        let mut image = Vec::new();
        let bogus_len: u16 = 0x3000; // > 8192 after masking compressed bit... actually masked value
        image.extend_from_slice(&bogus_len.to_le_bytes());
        let io = BlockIo::new(Cursor::new(image), 0);
        let store = MetadataStore::new(&io, Compressor::None, false);
        let mut dst = [0u8; 1];
        assert!(store.read(MetadataCursor::new(0, 0), &mut dst).is_err());
    }
}
