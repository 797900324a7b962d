use crate::compression::Compressor;
use crate::error::{corrupt, ImageError};

pub(crate) const SUPERBLOCK_SIZE: usize = 96;
pub(crate) const MAGIC: u32 = 0x7371_7368;
pub(crate) const NO_TABLE: u64 = u64::MAX;

const MIN_BLOCK_LOG: u16 = 12;
const MAX_BLOCK_LOG: u16 = 20;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Superblock {
    pub(crate) inode_count: u32,
    pub(crate) block_size: u32,
    pub(crate) fragment_count: u32,
    pub(crate) compressor: Compressor,
    pub(crate) root_inode: u64,
    pub(crate) bytes_used: u64,
    pub(crate) inode_table: u64,
    pub(crate) directory_table: u64,
    pub(crate) fragment_table: u64,
}

impl Superblock {
    pub(crate) fn parse(raw: &[u8; SUPERBLOCK_SIZE], image_size: u64) -> Result<Self, ImageError> {
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
        };
        let u64_at = |at: usize| {
            let mut bytes = [0_u8; 8];
            bytes.copy_from_slice(&raw[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let magic = u32_at(0);
        if magic != MAGIC {
            return Err(ImageError::BadMagic(magic));
        }

        let major = u16_at(28);
        let minor = u16_at(30);
        if (major, minor) != (4, 0) {
            return Err(ImageError::UnsupportedVersion { major, minor });
        }

        let compressor = Compressor::from_id(u16_at(20))?;

        let block_size = u32_at(12);
        let block_log = u16_at(22);
        if !(MIN_BLOCK_LOG..=MAX_BLOCK_LOG).contains(&block_log) || block_size != 1_u32 << block_log
        {
            return Err(corrupt(format!(
                "invalid block size {block_size} (log {block_log})"
            )));
        }

        let superblock = Self {
            inode_count: u32_at(4),
            block_size,
            fragment_count: u32_at(16),
            compressor,
            root_inode: u64_at(32),
            bytes_used: u64_at(40),
            inode_table: u64_at(64),
            directory_table: u64_at(72),
            fragment_table: u64_at(80),
        };
        superblock.validate(image_size)?;
        Ok(superblock)
    }

    fn validate(&self, image_size: u64) -> Result<(), ImageError> {
        if self.bytes_used > image_size || self.bytes_used < SUPERBLOCK_SIZE as u64 {
            return Err(corrupt(format!(
                "bytes_used {} does not fit image of {image_size} bytes",
                self.bytes_used
            )));
        }
        if self.inode_table < SUPERBLOCK_SIZE as u64
            || self.inode_table >= self.directory_table
            || self.directory_table >= self.bytes_used
        {
            return Err(corrupt(format!(
                "inconsistent table offsets (inodes {}, directories {}, used {})",
                self.inode_table, self.directory_table, self.bytes_used
            )));
        }
        if self.fragment_count > 0
            && (self.fragment_table == NO_TABLE || self.fragment_table >= self.bytes_used)
        {
            return Err(corrupt(format!(
                "fragment table offset {} is outside the image",
                self.fragment_table
            )));
        }
        Ok(())
    }
}
