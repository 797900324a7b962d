use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::error::{corrupt, ImageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compressor {
    Gzip,
    Zstd,
}

impl Compressor {
    pub(crate) fn from_id(id: u16) -> Result<Self, ImageError> {
        match id {
            1 => Ok(Self::Gzip),
            6 => Ok(Self::Zstd),
            other => Err(ImageError::UnsupportedCompressor(other)),
        }
    }

    /// Inflates `input`, refusing output larger than `limit` bytes.
    pub(crate) fn decompress(self, input: &[u8], limit: usize) -> Result<Vec<u8>, ImageError> {
        let mut out = Vec::new();
        let bounded = limit as u64 + 1;
        match self {
            Self::Gzip => {
                ZlibDecoder::new(input)
                    .take(bounded)
                    .read_to_end(&mut out)
                    .map_err(ImageError::Decompress)?;
            }
            Self::Zstd => {
                zstd::stream::read::Decoder::new(input)
                    .map_err(ImageError::Decompress)?
                    .take(bounded)
                    .read_to_end(&mut out)
                    .map_err(ImageError::Decompress)?;
            }
        }
        if out.len() > limit {
            return Err(corrupt(format!(
                "block decompresses to more than {limit} bytes"
            )));
        }
        Ok(out)
    }
}
