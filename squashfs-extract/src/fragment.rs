//! Data fragment table: the tail bytes of many small files packed into a
//! shared compressed block.

use deku::prelude::*;

pub const FRAGMENT_SIZE: usize =
    std::mem::size_of::<u64>() + std::mem::size_of::<u32>() + std::mem::size_of::<u32>();

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Fragment {
    pub start: u64,
    pub size: u32,
    pub unused: u32,
}

impl Fragment {
    /// `(compressed, on_disk_size)`, same packing as a data-block size entry.
    pub fn compressed_size(&self) -> (bool, u32) {
        const COMPRESSED_BIT: u32 = 1 << 24;
        (self.size & COMPRESSED_BIT == 0, self.size & !COMPRESSED_BIT)
    }
}
