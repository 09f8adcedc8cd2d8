//! Out-of-line staging for payloads above the inline ceiling.
//!
//! Remote backends cap the size of a single inline field. Envelopes larger
//! than the ceiling are written to a temporary file and the outgoing record
//! references the file instead of embedding the bytes. The file is released
//! once the send is acknowledged, successfully or not.

use crate::error::CodecResult;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Largest envelope (bytes) that travels inline.
pub const DEFAULT_INLINE_CEILING: usize = 20 * 1024;

const ASSET_EXTENSION: &str = "sbxasset";

/// A payload written to a temporary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAsset {
    path: PathBuf,
    len: u64,
}

impl StagedAsset {
    /// Path of the staged file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the staged payload in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the staged payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An encoded payload, either embedded or staged out of line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Embedded in the outgoing record.
    Inline(Vec<u8>),
    /// Referenced by path.
    Staged(StagedAsset),
}

impl Payload {
    /// Embeds `bytes` when they fit under `ceiling`, otherwise stages them.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the staging file cannot be written.
    pub fn prepare(bytes: Vec<u8>, ceiling: usize, stager: &AssetStager) -> CodecResult<Self> {
        if bytes.len() <= ceiling {
            Ok(Payload::Inline(bytes))
        } else {
            Ok(Payload::Staged(stager.stage(&bytes)?))
        }
    }

    /// Returns the payload bytes, reading the staged file if necessary.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a staged file is missing or unreadable.
    pub fn read(&self) -> CodecResult<Vec<u8>> {
        match self {
            Payload::Inline(bytes) => Ok(bytes.clone()),
            Payload::Staged(asset) => Ok(fs::read(&asset.path)?),
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Payload::Inline(bytes) => bytes.len() as u64,
            Payload::Staged(asset) => asset.len,
        }
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the staged asset, if any.
    pub fn staged(&self) -> Option<&StagedAsset> {
        match self {
            Payload::Inline(_) => None,
            Payload::Staged(asset) => Some(asset),
        }
    }
}

/// Writes and cleans up staged asset files in one directory.
#[derive(Debug, Clone)]
pub struct AssetStager {
    dir: PathBuf,
}

impl AssetStager {
    /// Creates a stager rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> CodecResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Creates a stager under the OS temporary directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn in_temp_dir() -> CodecResult<Self> {
        Self::new(std::env::temp_dir().join("syncbox-assets"))
    }

    /// The staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `bytes` to a new uniquely named file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn stage(&self, bytes: &[u8]) -> CodecResult<StagedAsset> {
        let name = format!("{}.{ASSET_EXTENSION}", uuid::Uuid::new_v4().simple());
        let path = self.dir.join(name);
        fs::write(&path, bytes)?;
        Ok(StagedAsset {
            path,
            len: bytes.len() as u64,
        })
    }

    /// Deletes a staged file. A file that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for any failure other than "not found".
    pub fn release(&self, asset: &StagedAsset) -> CodecResult<()> {
        match fs::remove_file(&asset.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes staged files older than `max_age`. Returns how many were removed.
    ///
    /// Files that cannot be inspected or removed are skipped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be listed.
    pub fn sweep(&self, max_age: Duration) -> CodecResult<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ASSET_EXTENSION) {
                continue;
            }

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();

            if age >= max_age && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }
}
