//! # syncbox Codec
//!
//! Payload envelopes for syncbox records.
//!
//! An envelope is a fixed 10-byte header followed by the entity's CBOR
//! body, optionally compressed:
//! - 8 bytes of magic identifying the format
//! - 1 version byte
//! - 1 algorithm byte (`0` = none, `1` = lz4; other ids fail to decode)
//!
//! Bodies at or above the compression threshold are compressed when that
//! actually makes them smaller. Envelopes above the inline ceiling are
//! staged to a temporary file by [`Payload::prepare`].
//!
//! ## Usage
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use syncbox_codec::{decode, encode, EnvelopeOptions};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Title {
//!     text: String,
//! }
//!
//! let value = Title { text: "hello".into() };
//! let bytes = encode(&value, &EnvelopeOptions::default()).unwrap();
//! let decoded: Title = decode(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compression;
mod envelope;
mod error;
mod staging;

pub use compression::{Algorithm, MAX_DECOMPRESSED_SIZE};
pub use envelope::{
    decode, encode, inspect_header, open, seal, EnvelopeHeader, EnvelopeOptions,
    DEFAULT_COMPRESSION_THRESHOLD, FORMAT_VERSION, HEADER_LEN, MAGIC,
};
pub use error::{CodecError, CodecResult};
pub use staging::{AssetStager, Payload, StagedAsset, DEFAULT_INLINE_CEILING};
