//! Directory table: [`Dir`] headers and the [`DirEntry`] rows under them.

use deku::prelude::*;

#[derive(Debug, DekuRead, DekuWrite, Clone)]
#[deku(endian = "little")]
pub struct Dir {
    pub count: u32,
    pub start: u32,
    pub inode_num: u32,
    #[deku(count = "*count + 1")]
    pub entries: Vec<DirEntry>,
}

#[derive(Debug, DekuRead, DekuWrite, Clone)]
#[deku(endian = "little")]
pub struct DirEntry {
    pub offset: u16,
    pub inode_offset: i16,
    pub t: u16,
    pub name_size: u16,
    #[deku(count = "*name_size + 1")]
    pub name: Vec<u8>,
}

/// Hints the directory-entry `type` field carries, per spec.md §3.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    ExtendedDir,
    ExtendedFile,
    ExtendedSymlink,
    ExtendedBlockDevice,
    ExtendedCharDevice,
    ExtendedFifo,
    ExtendedSocket,
}

impl DirEntry {
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn kind(&self) -> Option<EntryKind> {
        entry_kind(self.t)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind(), Some(EntryKind::Dir | EntryKind::ExtendedDir))
    }
}

/// Maps a directory entry's raw `type` field to an [`EntryKind`]; shared by
/// [`DirEntry`] and the format layer's resolved-entry view.
pub fn entry_kind(t: u16) -> Option<EntryKind> {
    use EntryKind::*;
    Some(match t {
        1 => Dir,
        2 => File,
        3 => Symlink,
        4 => BlockDevice,
        5 => CharDevice,
        6 => Fifo,
        7 => Socket,
        8 => ExtendedDir,
        9 => ExtendedFile,
        10 => ExtendedSymlink,
        11 => ExtendedBlockDevice,
        12 => ExtendedCharDevice,
        13 => ExtendedFifo,
        14 => ExtendedSocket,
        _ => return None,
    })
}

#[derive(Debug, DekuRead, DekuWrite, Clone)]
#[deku(endian = "little")]
pub struct DirectoryIndex {
    pub index: u32,
    pub start: u32,
    pub name_size: u32,
    #[deku(count = "*name_size + 1")]
    pub name: Vec<u8>,
}
