use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStringExt;

use crate::error::{corrupt, ImageError};
use crate::image::Image;
use crate::inode::{EntryKind, Inode, InodeData, InodeRef};
use crate::metadata::MetadataCursor;
use crate::source::ReadAt;

const HEADER_SIZE: u32 = 12;
const ENTRY_SIZE: u32 = 8;
const MAX_ENTRIES_PER_HEADER: u32 = 256;
const MAX_NAME_LEN: u32 = 256;
const MAX_LISTING_SIZE: u32 = 16 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: OsString,
    kind: EntryKind,
    inode: InodeRef,
}

impl DirEntry {
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn inode(&self) -> InodeRef {
        self.inode
    }
}

pub(crate) fn read_dir<R: ReadAt>(
    image: &Image<R>,
    directory: &Inode,
) -> Result<Vec<DirEntry>, ImageError> {
    let InodeData::Directory {
        block_index,
        block_offset,
        listing_size,
    } = directory.data()
    else {
        return Err(ImageError::WrongKind {
            number: directory.number(),
            expected: "directory",
        });
    };

    // the stored size counts the implicit "." and ".." entries
    if *listing_size < 3 || *listing_size > MAX_LISTING_SIZE {
        return Err(corrupt(format!(
            "directory inode {} has listing size {listing_size}",
            directory.number()
        )));
    }
    let mut remaining = listing_size - 3;
    if remaining == 0 {
        return Ok(Vec::new());
    }

    let position = image
        .superblock()
        .directory_table
        .checked_add(u64::from(*block_index))
        .ok_or(ImageError::OutOfBounds {
            what: "directory listing",
            offset: u64::from(*block_index),
            len: u64::from(remaining),
        })?;
    let mut cursor = MetadataCursor::new(image, position, *block_offset)?;

    let mut entries = Vec::new();
    while remaining > 0 {
        if remaining < HEADER_SIZE {
            return Err(corrupt("truncated directory header"));
        }
        let count = cursor.read_u32()?.saturating_add(1);
        let start = cursor.read_u32()?;
        let _base_number = cursor.read_u32()?;
        remaining -= HEADER_SIZE;
        if count > MAX_ENTRIES_PER_HEADER {
            return Err(corrupt(format!("directory header declares {count} entries")));
        }

        for _ in 0..count {
            if remaining < ENTRY_SIZE {
                return Err(corrupt("truncated directory entry"));
            }
            let offset = cursor.read_u16()?;
            let _number_delta = cursor.read_u16()?;
            let kind = EntryKind::from_type(cursor.read_u16()?)?;
            let name_len = u32::from(cursor.read_u16()?) + 1;
            remaining -= ENTRY_SIZE;
            if name_len > MAX_NAME_LEN || name_len > remaining {
                return Err(corrupt(format!("directory entry name of {name_len} bytes")));
            }
            let name = cursor.read_bytes(name_len as usize)?;
            remaining -= name_len;
            validate_entry_name(&name)?;

            entries.push(DirEntry {
                name: OsString::from_vec(name),
                kind,
                inode: InodeRef::new(start, offset),
            });
        }
    }

    Ok(entries)
}

fn validate_entry_name(name: &[u8]) -> Result<(), ImageError> {
    if name == b"." || name == b".." || name.contains(&b'/') || name.contains(&0) {
        return Err(corrupt(format!(
            "invalid directory entry name {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}
