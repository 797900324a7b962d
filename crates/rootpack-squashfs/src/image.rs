use std::ffi::OsString;
use std::fs::File;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use crate::dir::{self, DirEntry};
use crate::error::{corrupt, ImageError};
use crate::file::FileReader;
use crate::inode::{self, Inode, InodeData, InodeRef};
use crate::metadata::{MetadataCursor, METADATA_BLOCK_SIZE};
use crate::source::ReadAt;
use crate::superblock::{Superblock, SUPERBLOCK_SIZE};

const UNCOMPRESSED_METADATA: u16 = 0x8000;
const UNCOMPRESSED_DATA: u32 = 1 << 24;
const DATA_SIZE_MASK: u32 = UNCOMPRESSED_DATA - 1;
const FRAGMENT_ENTRY_SIZE: u64 = 16;
const FRAGMENTS_PER_BLOCK: u64 = METADATA_BLOCK_SIZE as u64 / FRAGMENT_ENTRY_SIZE;

pub struct Image<R> {
    source: R,
    superblock: Superblock,
}

impl Image<File> {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        Self::open(File::open(path)?)
    }
}

impl<R: ReadAt> Image<R> {
    pub fn open(source: R) -> Result<Self, ImageError> {
        let size = source.size()?;
        if size < SUPERBLOCK_SIZE as u64 {
            return Err(corrupt(format!(
                "image of {size} bytes is smaller than a superblock"
            )));
        }

        let mut raw = [0_u8; SUPERBLOCK_SIZE];
        source.read_exact_at(&mut raw, 0)?;
        let superblock = Superblock::parse(&raw, size)?;
        Ok(Self { source, superblock })
    }

    pub fn block_size(&self) -> u32 {
        self.superblock.block_size
    }

    #[cfg(test)]
    pub(crate) fn inode_count(&self) -> u32 {
        self.superblock.inode_count
    }

    pub fn root(&self) -> Result<Inode, ImageError> {
        let root = self.inode(InodeRef::from_raw(self.superblock.root_inode))?;
        if !root.is_dir() {
            return Err(ImageError::WrongKind {
                number: root.number(),
                expected: "directory",
            });
        }
        Ok(root)
    }

    pub fn inode(&self, reference: InodeRef) -> Result<Inode, ImageError> {
        inode::read_inode(self, reference)
    }

    pub fn read_dir(&self, directory: &Inode) -> Result<Vec<DirEntry>, ImageError> {
        dir::read_dir(self, directory)
    }

    pub fn lookup(&self, directory: &Inode, name: &str) -> Result<Option<DirEntry>, ImageError> {
        Ok(self
            .read_dir(directory)?
            .into_iter()
            .find(|entry| entry.name() == name))
    }

    pub fn read_link(&self, inode: &Inode) -> Result<PathBuf, ImageError> {
        match inode.data() {
            InodeData::Symlink { target } => {
                Ok(PathBuf::from(OsString::from_vec(target.clone())))
            }
            _ => Err(ImageError::WrongKind {
                number: inode.number(),
                expected: "symlink",
            }),
        }
    }

    pub fn file_reader(&self, inode: &Inode) -> Result<FileReader<'_, R>, ImageError> {
        FileReader::new(self, inode)
    }

    pub(crate) fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub(crate) fn read_range(
        &self,
        what: &'static str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, ImageError> {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.superblock.bytes_used);
        if !in_bounds {
            return Err(ImageError::OutOfBounds { what, offset, len });
        }

        let mut buf = vec![0_u8; len as usize];
        self.source.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Reads the metadata block whose header starts at `position`, returning
    /// its uncompressed bytes and the position of the following block.
    pub(crate) fn metadata_block(&self, position: u64) -> Result<(Vec<u8>, u64), ImageError> {
        let raw_header = self.read_range("metadata block header", position, 2)?;
        let header = u16::from_le_bytes([raw_header[0], raw_header[1]]);
        let size = u64::from(header & !UNCOMPRESSED_METADATA);
        if size == 0 || size > METADATA_BLOCK_SIZE as u64 {
            return Err(corrupt(format!(
                "metadata block at {position} declares size {size}"
            )));
        }

        let start = position + 2;
        let raw = self.read_range("metadata block", start, size)?;
        let data = if header & UNCOMPRESSED_METADATA != 0 {
            raw
        } else {
            self.superblock
                .compressor
                .decompress(&raw, METADATA_BLOCK_SIZE)?
        };
        if data.is_empty() {
            return Err(corrupt(format!("metadata block at {position} is empty")));
        }
        Ok((data, start + size))
    }

    /// Reads one data or fragment block. A zero size field is a sparse block.
    pub(crate) fn data_block(
        &self,
        position: u64,
        size_field: u32,
        expected_len: Option<usize>,
    ) -> Result<Vec<u8>, ImageError> {
        let size = size_field & DATA_SIZE_MASK;
        if size == 0 {
            return match expected_len {
                Some(len) => Ok(vec![0_u8; len]),
                None => Err(corrupt("fragment block cannot be sparse")),
            };
        }

        let block_size = self.superblock.block_size;
        if size > block_size {
            return Err(corrupt(format!(
                "data block at {position} is {size} bytes, larger than block size {block_size}"
            )));
        }

        let raw = self.read_range("data block", position, u64::from(size))?;
        let data = if size_field & UNCOMPRESSED_DATA != 0 {
            raw
        } else {
            self.superblock
                .compressor
                .decompress(&raw, block_size as usize)?
        };

        if let Some(expected) = expected_len {
            if data.len() != expected {
                return Err(corrupt(format!(
                    "data block at {position} holds {} bytes, expected {expected}",
                    data.len()
                )));
            }
        }
        Ok(data)
    }

    /// Looks up fragment `index`, returning its block position and size field.
    pub(crate) fn fragment(&self, index: u32) -> Result<(u64, u32), ImageError> {
        if index >= self.superblock.fragment_count {
            return Err(corrupt(format!(
                "fragment index {index} exceeds fragment count {}",
                self.superblock.fragment_count
            )));
        }

        let index = u64::from(index);
        let lookup_position = self.superblock.fragment_table + (index / FRAGMENTS_PER_BLOCK) * 8;
        let raw = self.read_range("fragment lookup table", lookup_position, 8)?;
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&raw);
        let block_position = u64::from_le_bytes(bytes);

        let offset = ((index % FRAGMENTS_PER_BLOCK) * FRAGMENT_ENTRY_SIZE) as u16;
        let mut cursor = MetadataCursor::new(self, block_position, offset)?;
        let start = cursor.read_u64()?;
        let size = cursor.read_u32()?;
        Ok((start, size))
    }
}
