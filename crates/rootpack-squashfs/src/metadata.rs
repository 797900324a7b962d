use crate::error::{corrupt, ImageError};
use crate::image::Image;
use crate::source::ReadAt;

pub(crate) const METADATA_BLOCK_SIZE: usize = 8192;

/// Sequential reader over a chain of metadata blocks.
pub(crate) struct MetadataCursor<'a, R> {
    image: &'a Image<R>,
    next_block: u64,
    block: Vec<u8>,
    position: usize,
}

impl<'a, R: ReadAt> MetadataCursor<'a, R> {
    pub(crate) fn new(image: &'a Image<R>, block: u64, offset: u16) -> Result<Self, ImageError> {
        let mut cursor = Self {
            image,
            next_block: block,
            block: Vec::new(),
            position: 0,
        };
        cursor.load_next()?;
        if usize::from(offset) >= cursor.block.len() {
            return Err(corrupt(format!(
                "offset {offset} is past the end of metadata block at {block}"
            )));
        }
        cursor.position = usize::from(offset);
        Ok(cursor)
    }

    fn load_next(&mut self) -> Result<(), ImageError> {
        let (block, next) = self.image.metadata_block(self.next_block)?;
        self.block = block;
        self.next_block = next;
        self.position = 0;
        Ok(())
    }

    pub(crate) fn read_exact(&mut self, out: &mut [u8]) -> Result<(), ImageError> {
        let mut filled = 0;
        while filled < out.len() {
            if self.position == self.block.len() {
                self.load_next()?;
            }
            let available = self.block.len() - self.position;
            let take = available.min(out.len() - filled);
            out[filled..filled + take]
                .copy_from_slice(&self.block[self.position..self.position + take]);
            self.position += take;
            filled += take;
        }
        Ok(())
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ImageError> {
        let mut out = vec![0_u8; len];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, ImageError> {
        let mut raw = [0_u8; 2];
        self.read_exact(&mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, ImageError> {
        let mut raw = [0_u8; 4];
        self.read_exact(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, ImageError> {
        let mut raw = [0_u8; 8];
        self.read_exact(&mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }
}
