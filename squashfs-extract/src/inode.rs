//! Inode table: common header plus the per-type payload spec.md §3 names.

use deku::prelude::*;

use crate::dir::DirectoryIndex;

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(ctx = "block_size: u32, block_log: u16")]
#[deku(endian = "little")]
pub struct Inode {
    pub id: InodeId,
    pub header: InodeHeader,
    #[deku(ctx = "*id, block_size, block_log")]
    pub inner: InodeInner,
}

impl Inode {
    pub fn inode_number(&self) -> u32 {
        self.header.inode_number
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.id, InodeId::BasicDirectory | InodeId::ExtendedDirectory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.id, InodeId::BasicFile | InodeId::ExtendedFile)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.id, InodeId::BasicSymlink | InodeId::ExtendedSymlink)
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(type = "u16")]
#[deku(endian = "little")]
#[rustfmt::skip]
pub enum InodeId {
    BasicDirectory       = 1,
    BasicFile            = 2,
    BasicSymlink         = 3,
    BasicBlockDevice     = 4,
    BasicCharacterDevice = 5,
    BasicFifo            = 6,
    BasicSocket          = 7,
    ExtendedDirectory    = 8,
    ExtendedFile         = 9,
    ExtendedSymlink      = 10,
    ExtendedBlockDevice  = 11,
    ExtendedCharacterDevice = 12,
    ExtendedFifo         = 13,
    ExtendedSocket       = 14,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct InodeHeader {
    pub permissions: u16,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub mtime: u32,
    pub inode_number: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(ctx = "id: InodeId, block_size: u32, block_log: u16")]
#[deku(endian = "little")]
#[deku(id = "id")]
pub enum InodeInner {
    #[deku(id = "InodeId::BasicDirectory")]
    BasicDirectory(BasicDirectory),

    #[deku(id = "InodeId::ExtendedDirectory")]
    ExtendedDirectory(ExtendedDirectory),

    #[deku(id = "InodeId::BasicFile")]
    BasicFile(#[deku(ctx = "block_size, block_log")] BasicFile),

    #[deku(id = "InodeId::ExtendedFile")]
    ExtendedFile(#[deku(ctx = "block_size, block_log")] ExtendedFile),

    #[deku(id = "InodeId::BasicSymlink")]
    BasicSymlink(BasicSymlink),

    #[deku(id = "InodeId::ExtendedSymlink")]
    ExtendedSymlink(ExtendedSymlink),

    #[deku(id = "InodeId::BasicBlockDevice")]
    BasicBlockDevice(BasicDeviceSpecialFile),

    #[deku(id = "InodeId::BasicCharacterDevice")]
    BasicCharacterDevice(BasicDeviceSpecialFile),

    #[deku(id = "InodeId::ExtendedBlockDevice")]
    ExtendedBlockDevice(ExtendedDeviceSpecialFile),

    #[deku(id = "InodeId::ExtendedCharacterDevice")]
    ExtendedCharacterDevice(ExtendedDeviceSpecialFile),

    #[deku(id = "InodeId::BasicFifo")]
    BasicFifo(BasicIpc),

    #[deku(id = "InodeId::BasicSocket")]
    BasicSocket(BasicIpc),

    #[deku(id = "InodeId::ExtendedFifo")]
    ExtendedFifo(ExtendedIpc),

    #[deku(id = "InodeId::ExtendedSocket")]
    ExtendedSocket(ExtendedIpc),
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct BasicDirectory {
    pub block_index: u32,
    pub link_count: u32,
    pub file_size: u16,
    pub block_offset: u16,
    pub parent_inode: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtendedDirectory {
    pub link_count: u32,
    pub file_size: u32,
    pub block_index: u32,
    pub parent_inode: u32,
    pub index_count: u16,
    pub block_offset: u16,
    pub xattr_index: u32,
    #[deku(count = "*index_count")]
    pub dir_index: Vec<DirectoryIndex>,
}

/// A block-size-list entry: `(compressed, size)`; zero marks a sparse block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct DataSize(pub u32);

impl DataSize {
    const COMPRESSED_BIT: u32 = 1 << 24;

    pub fn is_sparse(&self) -> bool {
        self.0 == 0
    }

    pub fn compressed(&self) -> bool {
        self.0 & Self::COMPRESSED_BIT == 0
    }

    pub fn size(&self) -> u32 {
        self.0 & !Self::COMPRESSED_BIT
    }
}

fn block_count(block_size: u32, block_log: u16, frag_index: u32, file_size: u64) -> u64 {
    const NO_FRAGMENT: u32 = 0xffff_ffff;
    if frag_index == NO_FRAGMENT {
        (file_size + u64::from(block_size) - 1) >> block_log
    } else {
        file_size >> block_log
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(ctx = "block_size: u32, block_log: u16")]
#[deku(endian = "little")]
pub struct BasicFile {
    pub blocks_start: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub file_size: u32,
    #[deku(count = "block_count(block_size, block_log, *frag_index, *file_size as u64)")]
    pub block_sizes: Vec<DataSize>,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(ctx = "block_size: u32, block_log: u16")]
#[deku(endian = "little")]
pub struct ExtendedFile {
    pub blocks_start: u64,
    pub file_size: u64,
    pub sparse: u64,
    pub link_count: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub xattr_index: u32,
    #[deku(count = "block_count(block_size, block_log, *frag_index, *file_size)")]
    pub block_sizes: Vec<DataSize>,
}

/// Common view over `BasicDirectory`/`ExtendedDirectory`. `file_size` is the
/// raw on-disk field, which is `3 +` the actual byte length of the
/// directory's header+entry listing (a long-standing format quirk).
pub struct DirView {
    pub block_index: u32,
    pub parent_inode: u32,
    pub block_offset: u16,
    pub file_size: u32,
}

impl DirView {
    /// The real byte length of this directory's listing in the directory
    /// table, correcting for the `+3` the on-disk `file_size` carries.
    pub fn listing_len(&self) -> usize {
        self.file_size.saturating_sub(3) as usize
    }
}

/// Common view over `BasicFile`/`ExtendedFile` used by the data pipeline.
pub struct FileView<'a> {
    pub blocks_start: u64,
    pub file_size: u64,
    pub frag_index: u32,
    pub block_offset: u32,
    pub block_sizes: &'a [DataSize],
    pub has_sparse: bool,
}

impl InodeInner {
    pub fn as_file(&self) -> Option<FileView<'_>> {
        match self {
            InodeInner::BasicFile(f) => Some(FileView {
                blocks_start: f.blocks_start as u64,
                file_size: f.file_size as u64,
                frag_index: f.frag_index,
                block_offset: f.block_offset,
                block_sizes: &f.block_sizes,
                has_sparse: false,
            }),
            InodeInner::ExtendedFile(f) => Some(FileView {
                blocks_start: f.blocks_start,
                file_size: f.file_size,
                frag_index: f.frag_index,
                block_offset: f.block_offset,
                block_sizes: &f.block_sizes,
                has_sparse: true,
            }),
            _ => None,
        }
    }

    pub fn as_dir(&self) -> Option<DirView> {
        match self {
            InodeInner::BasicDirectory(d) => Some(DirView {
                block_index: d.block_index,
                parent_inode: d.parent_inode,
                block_offset: d.block_offset,
                file_size: d.file_size as u32,
            }),
            InodeInner::ExtendedDirectory(d) => Some(DirView {
                block_index: d.block_index,
                parent_inode: d.parent_inode,
                block_offset: d.block_offset,
                file_size: d.file_size,
            }),
            _ => None,
        }
    }

    pub fn device_number(&self) -> Option<u32> {
        match self {
            InodeInner::BasicBlockDevice(d) | InodeInner::BasicCharacterDevice(d) => {
                Some(d.device_number)
            }
            InodeInner::ExtendedBlockDevice(d) | InodeInner::ExtendedCharacterDevice(d) => {
                Some(d.device_number)
            }
            _ => None,
        }
    }
}

const NO_FRAGMENT: u32 = 0xffff_ffff;

impl FileView<'_> {
    pub fn has_fragment(&self) -> bool {
        self.frag_index != NO_FRAGMENT
    }
}

/// Decode a device's packed `(major, minor)` per the Linux
/// `new_encode_dev` layout spec.md §3 documents.
pub fn decode_device(data: u32) -> (u32, u32) {
    let major = (data >> 8) & 0xfff;
    let minor = (data & 0xff) | ((data >> 12) & 0xfff00);
    (major, minor)
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct BasicDeviceSpecialFile {
    pub link_count: u32,
    pub device_number: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtendedDeviceSpecialFile {
    pub link_count: u32,
    pub device_number: u32,
    pub xattr_index: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct BasicSymlink {
    pub link_count: u32,
    pub target_size: u32,
    #[deku(count = "*target_size")]
    pub target_path: Vec<u8>,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtendedSymlink {
    pub link_count: u32,
    pub target_size: u32,
    #[deku(count = "*target_size")]
    pub target_path: Vec<u8>,
    pub xattr_index: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct BasicIpc {
    pub link_count: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtendedIpc {
    pub link_count: u32,
    pub xattr_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_decoding_matches_linux_new_encode_dev() {
        // major=8 (sd), minor=1 -> typical /dev/sda1 encoding
        let encoded = (1u32 & 0xff) | ((8u32 & 0xfff) << 8);
        assert_eq!(decode_device(encoded), (8, 1));
    }

    #[test]
    fn sparse_block_is_zero() {
        let d = DataSize(0);
        assert!(d.is_sparse());
        let d = DataSize((1 << 24) | 17);
        assert!(!d.is_sparse());
        assert_eq!(d.size(), 17);
        assert!(!d.compressed());
    }
}
