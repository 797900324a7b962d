use std::io::{self, Read};

use crate::error::{corrupt, ImageError};
use crate::image::Image;
use crate::inode::{Inode, InodeData};
use crate::source::ReadAt;

const DATA_SIZE_MASK: u32 = (1 << 24) - 1;

/// Streams the contents of a regular file, one block at a time.
pub struct FileReader<'a, R> {
    image: &'a Image<R>,
    block_sizes: Vec<u32>,
    next_block: usize,
    data_position: u64,
    fragment: Option<(u32, u32)>,
    remaining: u64,
    buffer: Vec<u8>,
    buffer_position: usize,
}

impl<'a, R: ReadAt> FileReader<'a, R> {
    pub(crate) fn new(image: &'a Image<R>, inode: &Inode) -> Result<Self, ImageError> {
        let InodeData::File {
            blocks_start,
            size,
            fragment,
            block_sizes,
        } = inode.data()
        else {
            return Err(ImageError::WrongKind {
                number: inode.number(),
                expected: "regular file",
            });
        };

        Ok(Self {
            image,
            block_sizes: block_sizes.clone(),
            next_block: 0,
            data_position: *blocks_start,
            fragment: *fragment,
            remaining: *size,
            buffer: Vec::new(),
            buffer_position: 0,
        })
    }

    fn fill(&mut self) -> Result<(), ImageError> {
        let block_size = u64::from(self.image.block_size());
        let data = if let Some(size_field) = self.block_sizes.get(self.next_block).copied() {
            let expected = self.remaining.min(block_size) as usize;
            let data = self
                .image
                .data_block(self.data_position, size_field, Some(expected))?;
            self.data_position += u64::from(size_field & DATA_SIZE_MASK);
            self.next_block += 1;
            data
        } else if let Some((index, offset)) = self.fragment.take() {
            let (start, size_field) = self.image.fragment(index)?;
            let block = self.image.data_block(start, size_field, None)?;
            let begin = offset as usize;
            let end = begin
                .checked_add(self.remaining as usize)
                .filter(|end| *end <= block.len())
                .ok_or_else(|| {
                    corrupt(format!(
                        "fragment {index} is too short for a {} byte tail at offset {offset}",
                        self.remaining
                    ))
                })?;
            block[begin..end].to_vec()
        } else {
            return Err(corrupt(format!(
                "file data ends {} bytes before its declared size",
                self.remaining
            )));
        };

        self.remaining -= data.len() as u64;
        self.buffer = data;
        self.buffer_position = 0;
        Ok(())
    }
}

impl<R: ReadAt> Read for FileReader<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buffer_position == self.buffer.len() {
            if self.remaining == 0 {
                return Ok(0);
            }
            self.fill().map_err(io::Error::other)?;
        }

        let available = &self.buffer[self.buffer_position..];
        let take = available.len().min(out.len());
        out[..take].copy_from_slice(&available[..take]);
        self.buffer_position += take;
        Ok(take)
    }
}
