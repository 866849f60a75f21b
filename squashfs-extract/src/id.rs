//! ID lookup table: inode `uid`/`gid` fields index into this table.

use deku::prelude::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Id(pub u32);

impl Id {
    pub const SIZE: usize = std::mem::size_of::<u32>();
}
