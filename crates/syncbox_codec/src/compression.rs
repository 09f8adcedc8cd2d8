//! Compression algorithms addressable from the envelope header.

use crate::error::{CodecError, CodecResult};

/// Upper bound on a declared decompressed size.
///
/// The lz4 frame carries its own length prefix; a corrupt prefix must not
/// turn into a multi-gigabyte allocation.
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024 * 1024;

/// Compression algorithm recorded in the envelope's algorithm byte.
///
/// Ids `2..=4` are reserved for future compressors. Decoding a payload
/// that names an id this build does not know fails explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Body stored as serialized, no compression.
    None,
    /// LZ4 block with a little-endian `u32` size prefix.
    Lz4,
}

impl Algorithm {
    /// Converts to the header byte.
    pub fn to_code(&self) -> u8 {
        match self {
            Algorithm::None => 0,
            Algorithm::Lz4 => 1,
        }
    }

    /// Converts from the header byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Algorithm::None),
            1 => Some(Algorithm::Lz4),
            _ => None,
        }
    }

    /// Compresses `data`, returning `None` when the algorithm stores raw bytes.
    pub(crate) fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        match self {
            Algorithm::None => None,
            Algorithm::Lz4 => Some(lz4_flex::compress_prepend_size(data)),
        }
    }

    /// Reverses [`Algorithm::compress`].
    pub(crate) fn decompress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        match self {
            Algorithm::None => Ok(data.to_vec()),
            Algorithm::Lz4 => {
                let prefix: [u8; 4] = data
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| CodecError::decompression("lz4 body shorter than size prefix"))?;
                let declared = u32::from_le_bytes(prefix) as usize;
                if declared > MAX_DECOMPRESSED_SIZE {
                    return Err(CodecError::decompression(format!(
                        "declared size {declared} exceeds limit"
                    )));
                }
                lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| CodecError::decompression(e.to_string()))
            }
        }
    }
}
