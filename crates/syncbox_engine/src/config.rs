//! Configuration for the sync engine.

use std::path::PathBuf;
use std::time::Duration;
use syncbox_codec::{EnvelopeOptions, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_INLINE_CEILING};

/// Default number of outbox entries read per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default quiet period after a local change before sending.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(3);

/// Zone owner used when the backend does not name one.
pub const DEFAULT_OWNER: &str = "__defaultOwner__";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device ID, carried in every trace key.
    pub device_id: String,
    /// Remote zone holding this identity's records.
    pub zone: String,
    /// Zone owner, part of the sync metadata key.
    pub owner: String,
    /// Maximum outbox entries read per batch.
    pub batch_size: usize,
    /// Quiet period after a local change before sending.
    pub debounce: Duration,
    /// Envelopes above this size are staged out of line.
    pub inline_ceiling: usize,
    /// Bodies at or above this size are compressed.
    pub compression_threshold: usize,
    /// Directory for staged assets.
    pub staging_dir: PathBuf,
    /// Staged assets older than this are removed at startup.
    pub asset_max_age: Duration,
}

impl SyncConfig {
    /// Creates a configuration with defaults.
    pub fn new(device_id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            zone: zone.into(),
            owner: DEFAULT_OWNER.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            debounce: DEFAULT_DEBOUNCE,
            inline_ceiling: DEFAULT_INLINE_CEILING,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            staging_dir: std::env::temp_dir().join("syncbox-assets"),
            asset_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the zone owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the debounce delay.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the inline ceiling.
    pub fn with_inline_ceiling(mut self, ceiling: usize) -> Self {
        self.inline_ceiling = ceiling;
        self
    }

    /// Sets the compression threshold.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Sets the staging directory.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Sets the maximum age of leftover staged assets.
    pub fn with_asset_max_age(mut self, age: Duration) -> Self {
        self.asset_max_age = age;
        self
    }

    /// Envelope options for outgoing payloads.
    pub fn envelope_options(&self) -> EnvelopeOptions {
        EnvelopeOptions::default().with_compression_threshold(self.compression_threshold)
    }
}
