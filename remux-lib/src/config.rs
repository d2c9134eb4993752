//! Conversion options

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where chunk payloads are kept between assembly and finalize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// One temporary file per chunk
    #[default]
    Spill,
    /// Process memory
    Memory,
}

/// Spillover blob store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,

    /// Parent directory for spill files (system temp dir when unset)
    pub spill_dir: Option<PathBuf>,

    /// Delay before the store is closed after a successful conversion
    pub release_grace_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Spill,
            spill_dir: None,
            release_grace_ms: 0,
        }
    }
}

impl StoreConfig {
    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    pub fn memory() -> Self {
        Self {
            kind: StoreKind::Memory,
            ..Default::default()
        }
    }
}

/// Options recognized by a conversion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemuxOptions {
    /// Duration hint in seconds, forwarded to the re-encode fallback
    pub duration: Option<f64>,

    /// Codec label used when the video codec string cannot be inferred
    pub video_codec: Option<String>,

    /// Codec label used when the audio codec string cannot be inferred
    pub audio_codec: Option<String>,

    /// Explicit mime type for the output artifact
    pub mime_type: Option<String>,

    /// Drop the composition-offset table of video tracks that do not need one
    pub flatten_composition_offsets: bool,

    /// Blob store settings
    pub store: StoreConfig,
}

impl RemuxOptions {
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }
}
