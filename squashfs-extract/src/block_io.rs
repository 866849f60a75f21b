//! Positioned reads from the backing image file.

use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::sync::Mutex;

use tracing::instrument;

use crate::error::{Error, Result};

/// Anything the pipeline can read the backing image through.
pub trait BufReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> BufReadSeek for T {}

/// Serializes positioned reads against a single backing-file handle, adding
/// a configurable `start_offset` so embedded images (offset within a larger
/// firmware blob) read as if they began at byte 0.
pub struct BlockIo<R> {
    inner: Mutex<R>,
    start_offset: u64,
}

impl<R: BufReadSeek> BlockIo<R> {
    pub fn new(inner: R, start_offset: u64) -> Self {
        Self { inner: Mutex::new(inner), start_offset }
    }

    /// Read exactly `dst.len()` bytes starting at `offset` (relative to
    /// `start_offset`). Retries on `Interrupted`; reports a distinct
    /// "unexpected EOF" error rather than propagating `io::ErrorKind::UnexpectedEof`
    /// bare, per spec.md §4.1.
    #[instrument(skip(self, dst))]
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.seek(SeekFrom::Start(self.start_offset + offset))?;
        let mut pos = 0;
        while pos < dst.len() {
            match guard.read(&mut dst[pos..]) {
                Ok(0) => return Err(Error::UnexpectedEof),
                Ok(n) => pos += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_at_respects_start_offset() {
        let data = b"XXXXhello world".to_vec();
        let io = BlockIo::new(Cursor::new(data), 4);
        let mut buf = [0u8; 5];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        io.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn read_past_end_is_unexpected_eof() {
        let io = BlockIo::new(Cursor::new(b"abc".to_vec()), 0);
        let mut buf = [0u8; 10];
        let err = io.read_at(0, &mut buf).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
    }
}
