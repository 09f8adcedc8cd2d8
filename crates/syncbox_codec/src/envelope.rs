//! Payload envelope encoding.
//!
//! Layout:
//!
//! ```text
//! +----------------+---------+-----------+------------------------+
//! | magic (8)      | version | algorithm | body (CBOR, maybe lz4) |
//! +----------------+---------+-----------+------------------------+
//! ```

use crate::compression::Algorithm;
use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes identifying a payload envelope.
pub const MAGIC: [u8; 8] = *b"SBXENVL\0";

/// Current envelope format version.
pub const FORMAT_VERSION: u8 = 1;

/// Header length: magic + version + algorithm.
pub const HEADER_LEN: usize = MAGIC.len() + 2;

/// Serialized size at which compression is attempted.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Options controlling envelope construction.
#[derive(Debug, Clone)]
pub struct EnvelopeOptions {
    /// Serialized size (bytes) at or above which compression is attempted.
    pub compression_threshold: usize,
    /// Compressor used above the threshold.
    pub algorithm: Algorithm,
}

impl EnvelopeOptions {
    /// Creates options with the default threshold and lz4.
    pub fn new() -> Self {
        Self {
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            algorithm: Algorithm::Lz4,
        }
    }

    /// Sets the compression threshold.
    #[must_use]
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Sets the compressor.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Disables compression entirely.
    #[must_use]
    pub fn uncompressed() -> Self {
        Self::new().with_algorithm(Algorithm::None)
    }
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Format version.
    pub version: u8,
    /// Compression algorithm of the body.
    pub algorithm: Algorithm,
}

/// Serializes `value` to CBOR and wraps it in an envelope.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T, options: &EnvelopeOptions) -> CodecResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(value, &mut body)
        .map_err(|e| CodecError::serialization(e.to_string()))?;
    Ok(seal(&body, options))
}

/// Wraps already-serialized bytes in an envelope.
///
/// The body is compressed when it reaches the threshold and the compressed
/// form is strictly smaller; otherwise it is stored as-is with algorithm 0.
pub fn seal(body: &[u8], options: &EnvelopeOptions) -> Vec<u8> {
    let compressed = if body.len() >= options.compression_threshold {
        options
            .algorithm
            .compress(body)
            .filter(|packed| packed.len() < body.len())
    } else {
        None
    };

    let (algorithm, payload) = match &compressed {
        Some(packed) => (options.algorithm, packed.as_slice()),
        None => (Algorithm::None, body),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.push(algorithm.to_code());
    out.extend_from_slice(payload);
    out
}

/// Validates and reads the envelope header.
///
/// # Errors
///
/// - [`CodecError::Format`] on short input, wrong magic or unknown version.
/// - [`CodecError::UnsupportedAlgorithm`] on an unknown algorithm id.
pub fn inspect_header(bytes: &[u8]) -> CodecResult<EnvelopeHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::format(format!(
            "envelope too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(CodecError::format("bad magic"));
    }

    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(CodecError::format(format!(
            "unsupported envelope version {version}"
        )));
    }

    let code = bytes[MAGIC.len() + 1];
    let algorithm = Algorithm::from_code(code).ok_or(CodecError::UnsupportedAlgorithm(code))?;

    Ok(EnvelopeHeader { version, algorithm })
}

/// Returns the serialized body of an envelope, decompressing if needed.
///
/// # Errors
///
/// See [`inspect_header`]; additionally [`CodecError::Decompression`] on a
/// corrupt compressed body.
pub fn open(bytes: &[u8]) -> CodecResult<Vec<u8>> {
    let header = inspect_header(bytes)?;
    header.algorithm.decompress(&bytes[HEADER_LEN..])
}

/// Opens an envelope and deserializes its body.
///
/// # Errors
///
/// See [`open`]; additionally [`CodecError::Deserialization`] if the body
/// does not describe a `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let body = open(bytes)?;
    ciborium::de::from_reader(body.as_slice())
        .map_err(|e| CodecError::deserialization(e.to_string()))
}
