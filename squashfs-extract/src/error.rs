//! Errors

use std::io;

use thiserror::Error;

/// Errors generated by this crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("std io error: {0}")]
    Io(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] std::string::FromUtf8Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("corrupt or invalid squashfs image: {0}")]
    CorruptFormat(String),

    #[error("corrupt metadata stream: {0}")]
    CorruptMetadata(String),

    #[error("unsupported compressor: {0:?}")]
    UnsupportedCompressor(crate::compressor::Compressor),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    #[error("unexpected end of file while reading the backing image")]
    UnexpectedEof,

    #[error("filesystem create error: {0}")]
    FsCreate(#[from] FsCreateError),

    #[error("xattr application failed: {0}")]
    XattrFailed(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

#[derive(Error, Debug)]
pub enum FsCreateError {
    #[error("permission denied creating {0}")]
    Permission(String),

    #[error("{0} already exists")]
    Exists(String),

    #[error("{0}: {1}")]
    Other(String, io::Error),
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        use Error::*;
        match value {
            Io(e) => e,
            Deku(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            StringUtf8(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            Regex(e) => io::Error::new(io::ErrorKind::InvalidInput, e),
            e @ (CorruptFormat(_) | CorruptMetadata(_)) => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
            e @ UnsupportedCompressor(_) => io::Error::new(io::ErrorKind::Unsupported, e),
            e @ DecompressFailed(_) => io::Error::new(io::ErrorKind::InvalidData, e),
            e @ UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            FsCreate(e) => io::Error::new(io::ErrorKind::Other, e),
            e @ XattrFailed(_) => io::Error::new(io::ErrorKind::Other, e),
            e @ InvalidArgs(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
            e @ ResourceExhausted(_) => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
