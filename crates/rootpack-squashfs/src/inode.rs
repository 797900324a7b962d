use crate::error::{corrupt, ImageError};
use crate::image::Image;
use crate::metadata::{MetadataCursor, METADATA_BLOCK_SIZE};
use crate::source::ReadAt;

const NO_FRAGMENT: u32 = u32::MAX;
const MAX_SYMLINK_TARGET: u32 = 4096;
const MAX_FILE_BLOCKS: u64 = 1 << 22;

/// Location of an inode: metadata block offset (relative to the inode table)
/// in the upper bits, byte offset inside the uncompressed block in the lower 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeRef(u64);

impl InodeRef {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn new(block: u32, offset: u16) -> Self {
        Self((u64::from(block) << 16) | u64::from(offset))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    fn block(self) -> u64 {
        self.0 >> 16
    }

    fn offset(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl EntryKind {
    pub(crate) fn from_type(kind: u16) -> Result<Self, ImageError> {
        match kind {
            1 | 8 => Ok(Self::Directory),
            2 | 9 => Ok(Self::File),
            3 | 10 => Ok(Self::Symlink),
            4 | 11 => Ok(Self::BlockDevice),
            5 | 12 => Ok(Self::CharDevice),
            6 | 13 => Ok(Self::Fifo),
            7 | 14 => Ok(Self::Socket),
            other => Err(corrupt(format!("unknown inode type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InodeData {
    Directory {
        block_index: u32,
        block_offset: u16,
        listing_size: u32,
    },
    File {
        blocks_start: u64,
        size: u64,
        fragment: Option<(u32, u32)>,
        block_sizes: Vec<u32>,
    },
    Symlink {
        target: Vec<u8>,
    },
    Special,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    number: u32,
    kind: EntryKind,
    permissions: u32,
    data: InodeData,
}

impl Inode {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Permission bits, including setuid/setgid/sticky.
    pub fn permissions(&self) -> u32 {
        self.permissions
    }

    /// Uncompressed size for regular files, zero for everything else.
    pub fn file_size(&self) -> u64 {
        match &self.data {
            InodeData::File { size, .. } => *size,
            _ => 0,
        }
    }

    pub(crate) fn data(&self) -> &InodeData {
        &self.data
    }
}

pub(crate) fn read_inode<R: ReadAt>(
    image: &Image<R>,
    reference: InodeRef,
) -> Result<Inode, ImageError> {
    let superblock = image.superblock();
    if usize::from(reference.offset()) >= METADATA_BLOCK_SIZE {
        return Err(corrupt(format!(
            "inode reference {:#x} has offset beyond a metadata block",
            reference.raw()
        )));
    }
    let position = superblock
        .inode_table
        .checked_add(reference.block())
        .filter(|position| *position < superblock.directory_table)
        .ok_or(ImageError::OutOfBounds {
            what: "inode",
            offset: reference.block(),
            len: 0,
        })?;

    let mut cursor = MetadataCursor::new(image, position, reference.offset())?;
    let inode_type = cursor.read_u16()?;
    let mode = cursor.read_u16()?;
    let _uid_index = cursor.read_u16()?;
    let _gid_index = cursor.read_u16()?;
    let _mtime = cursor.read_u32()?;
    let number = cursor.read_u32()?;
    let kind = EntryKind::from_type(inode_type)?;

    let data = match inode_type {
        1 => {
            let block_index = cursor.read_u32()?;
            let _link_count = cursor.read_u32()?;
            let listing_size = u32::from(cursor.read_u16()?);
            let block_offset = cursor.read_u16()?;
            InodeData::Directory {
                block_index,
                block_offset,
                listing_size,
            }
        }
        8 => {
            let _link_count = cursor.read_u32()?;
            let listing_size = cursor.read_u32()?;
            let block_index = cursor.read_u32()?;
            let _parent = cursor.read_u32()?;
            let _index_count = cursor.read_u16()?;
            let block_offset = cursor.read_u16()?;
            InodeData::Directory {
                block_index,
                block_offset,
                listing_size,
            }
        }
        2 => {
            let blocks_start = u64::from(cursor.read_u32()?);
            let fragment = cursor.read_u32()?;
            let fragment_offset = cursor.read_u32()?;
            let size = u64::from(cursor.read_u32()?);
            read_file(
                &mut cursor,
                superblock.block_size,
                blocks_start,
                size,
                fragment,
                fragment_offset,
            )?
        }
        9 => {
            let blocks_start = cursor.read_u64()?;
            let size = cursor.read_u64()?;
            let _sparse = cursor.read_u64()?;
            let _link_count = cursor.read_u32()?;
            let fragment = cursor.read_u32()?;
            let fragment_offset = cursor.read_u32()?;
            let _xattr = cursor.read_u32()?;
            read_file(
                &mut cursor,
                superblock.block_size,
                blocks_start,
                size,
                fragment,
                fragment_offset,
            )?
        }
        3 | 10 => {
            let _link_count = cursor.read_u32()?;
            let target_size = cursor.read_u32()?;
            if target_size == 0 || target_size > MAX_SYMLINK_TARGET {
                return Err(corrupt(format!(
                    "symlink inode {number} has target size {target_size}"
                )));
            }
            InodeData::Symlink {
                target: cursor.read_bytes(target_size as usize)?,
            }
        }
        _ => InodeData::Special,
    };

    Ok(Inode {
        number,
        kind,
        permissions: u32::from(mode) & 0o7777,
        data,
    })
}

fn read_file<R: ReadAt>(
    cursor: &mut MetadataCursor<'_, R>,
    block_size: u32,
    blocks_start: u64,
    size: u64,
    fragment: u32,
    fragment_offset: u32,
) -> Result<InodeData, ImageError> {
    let block_size = u64::from(block_size);
    let fragment = (fragment != NO_FRAGMENT).then_some((fragment, fragment_offset));
    let block_count = if fragment.is_some() {
        size / block_size
    } else {
        size.div_ceil(block_size)
    };
    if block_count > MAX_FILE_BLOCKS {
        return Err(corrupt(format!(
            "file of {size} bytes needs {block_count} blocks"
        )));
    }
    if fragment.is_some() && size % block_size == 0 {
        return Err(corrupt(format!(
            "file of {size} bytes has a fragment but no tail"
        )));
    }

    let mut block_sizes = Vec::new();
    for _ in 0..block_count {
        block_sizes.push(cursor.read_u32()?);
    }

    Ok(InodeData::File {
        blocks_start,
        size,
        fragment,
        block_sizes,
    })
}
