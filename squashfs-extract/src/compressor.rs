//! Compressor identifiers and the `uncompress` capability.
//!
//! The concrete decompressor implementations are the out-of-scope
//! collaborators named in the design; this module exposes them only through
//! [`decompress`], matching the shape of `SQUASHFS_METADATA_SIZE`-bounded
//! calls the pipeline makes.

use deku::prelude::*;

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "little")]
#[deku(type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzma = 2,
    Lzo  = 3,
    #[default]
    Xz   = 4,
    Lz4  = 5,
    Zstd = 6,
}

/// Decompress `src` into `dst`, truncating/resizing `dst` to the produced
/// length. Mirrors the `uncompress(src, dst, explen) -> Result<usize>`
/// capability named in the design: `explen` is `dst.len()` on entry (the
/// superblock's `block_size`, or up to 8 KiB for metadata).
pub fn decompress(src: &[u8], dst: &mut Vec<u8>, compressor: Compressor) -> Result<usize> {
    let explen = dst.len();
    match compressor {
        #[cfg(feature = "gzip")]
        Compressor::Gzip => {
            use std::io::Read;
            // `take(explen + 1)` bounds the read one byte past the expected
            // length, so a corrupt block that inflates past `explen` is
            // caught as an error instead of overflowing the caller's
            // fixed-size buffer on the copy-back.
            let mut decoder = flate2::read::ZlibDecoder::new(src).take(explen as u64 + 1);
            dst.clear();
            decoder
                .read_to_end(dst)
                .map_err(|e| Error::DecompressFailed(e.to_string()))?;
            if dst.len() > explen {
                return Err(Error::DecompressFailed(format!(
                    "decompressed {} bytes, expected at most {explen}",
                    dst.len()
                )));
            }
            Ok(dst.len())
        }
        #[cfg(feature = "xz")]
        Compressor::Xz | Compressor::Lzma => {
            use std::io::Read;
            let mut decoder = xz2::read::XzDecoder::new(src).take(explen as u64 + 1);
            dst.clear();
            decoder
                .read_to_end(dst)
                .map_err(|e| Error::DecompressFailed(e.to_string()))?;
            if dst.len() > explen {
                return Err(Error::DecompressFailed(format!(
                    "decompressed {} bytes, expected at most {explen}",
                    dst.len()
                )));
            }
            Ok(dst.len())
        }
        #[cfg(feature = "lzo")]
        Compressor::Lzo => {
            let out = rust_lzo::LZOContext::decompress_safe(src, explen)
                .map_err(|e| Error::DecompressFailed(format!("{e:?}")))?;
            dst.clear();
            dst.extend_from_slice(&out);
            Ok(dst.len())
        }
        #[cfg(feature = "zstd")]
        Compressor::Zstd => {
            // Capping the capacity at `explen` makes `zstd::bulk::decompress`
            // itself reject a block that would inflate past the caller's
            // buffer, instead of silently handing back something larger.
            let out = zstd::bulk::decompress(src, explen)
                .map_err(|e| Error::DecompressFailed(e.to_string()))?;
            dst.clear();
            dst.extend_from_slice(&out);
            Ok(dst.len())
        }
        #[cfg(feature = "lz4")]
        Compressor::Lz4 => {
            dst.resize(explen, 0);
            let n = lz4_flex::decompress_into(src, dst)
                .map_err(|e| Error::DecompressFailed(e.to_string()))?;
            dst.truncate(n);
            Ok(n)
        }
        Compressor::None => {
            dst.clear();
            dst.extend_from_slice(src);
            Ok(dst.len())
        }
        #[allow(unreachable_patterns)]
        other => Err(Error::UnsupportedCompressor(other)),
    }
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little", ctx = "compressor: Compressor")]
#[deku(id = "compressor")]
pub enum CompressionOptions {
    #[deku(id = "Compressor::Gzip")]
    Gzip(Gzip),
    #[deku(id = "Compressor::Lzo")]
    Lzo(Lzo),
    #[deku(id = "Compressor::Xz")]
    Xz(Xz),
    #[deku(id = "Compressor::Lz4")]
    Lz4(Lz4),
    #[deku(id = "Compressor::Zstd")]
    Zstd(Zstd),
    #[deku(id_pat = "_")]
    None,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Gzip {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Lzo {
    pub algorithm: u32,
    pub compression_level: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Xz {
    pub dictionary_size: u32,
    pub filters: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Lz4 {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Zstd {
    pub compression_level: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_roundtrip() {
        use std::io::Write;
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"hello world").unwrap();
        let compressed = enc.finish().unwrap();
        let mut out = vec![0u8; 11];
        let n = decompress(&compressed, &mut out, Compressor::Gzip).unwrap();
        assert_eq!(&out[..n], b"hello world");
    }

    #[test]
    fn none_is_passthrough() {
        let mut out = vec![0u8; 5];
        let n = decompress(b"abcde", &mut out, Compressor::None).unwrap();
        assert_eq!(&out[..n], b"abcde");
    }
}
