//! Error types for the codec crate.

use std::io;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while building or opening an envelope.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The bytes are not a payload envelope (bad magic, version or length).
    #[error("format error: {message}")]
    Format {
        /// Description of the format problem.
        message: String,
    },

    /// The algorithm byte names a compressor this build does not know.
    #[error("unsupported compression algorithm id {0}")]
    UnsupportedAlgorithm(u8),

    /// The compressed body is corrupt.
    #[error("decompression failed: {message}")]
    Decompression {
        /// Description of the decompression failure.
        message: String,
    },

    /// The entity could not be serialized.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The decoded body does not describe the requested type.
    #[error("deserialization failed: {message}")]
    Deserialization {
        /// Description of the deserialization failure.
        message: String,
    },

    /// I/O error while staging or reading an out-of-line asset.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a decompression error.
    pub fn decompression(message: impl Into<String>) -> Self {
        Self::Decompression {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a deserialization error.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CodecError::UnsupportedAlgorithm(7);
        assert_eq!(err.to_string(), "unsupported compression algorithm id 7");

        let err = CodecError::format("bad magic");
        assert!(err.to_string().contains("bad magic"));
    }
}
