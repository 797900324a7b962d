//! Read-only access to SquashFS 4.0 images.
//!
//! The reader never loads the whole image: every table and data block is
//! fetched with positioned reads through [`ReadAt`], and every offset or size
//! taken from the image is checked against the image length before use.

mod compression;
mod dir;
mod error;
mod file;
mod image;
mod inode;
mod metadata;
mod source;
mod superblock;

#[cfg(any(test, feature = "test-support"))]
mod builder;

pub use dir::DirEntry;
pub use error::ImageError;
pub use file::FileReader;
pub use image::Image;
pub use inode::{EntryKind, Inode, InodeRef};
pub use source::ReadAt;

#[cfg(any(test, feature = "test-support"))]
pub use builder::ImageBuilder;
