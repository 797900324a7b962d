use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed reading image: {0}")]
    Io(#[from] io::Error),
    #[error("not a squashfs image (magic {0:#010x})")]
    BadMagic(u32),
    #[error("unsupported squashfs version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("unsupported squashfs compressor id {0}")]
    UnsupportedCompressor(u16),
    #[error("{what} at offset {offset} (length {len}) lies outside the image")]
    OutOfBounds {
        what: &'static str,
        offset: u64,
        len: u64,
    },
    #[error("corrupt image: {0}")]
    Corrupt(String),
    #[error("failed decompressing block: {0}")]
    Decompress(#[source] io::Error),
    #[error("inode {number} is not a {expected}")]
    WrongKind { number: u32, expected: &'static str },
}

pub(crate) fn corrupt(message: impl Into<String>) -> ImageError {
    ImageError::Corrupt(message.into())
}
