//! Fragment source adapter
//!
//! Normalizes the accepted input shapes into one ordered list of
//! [`FragmentRecord`]s. Payloads stay unresolved until the assembler asks
//! for them.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{RemuxError, Result};
use crate::types::{SequenceInfo, TrackKind};

/// Lazily resolved fragment payload
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch(&self) -> Result<Bytes>;
}

#[async_trait]
impl DataProvider for Bytes {
    async fn fetch(&self) -> Result<Bytes> {
        Ok(self.clone())
    }
}

/// Payload read from a file on each fetch
#[derive(Debug, Clone)]
pub struct FileProvider {
    path: PathBuf,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataProvider for FileProvider {
    async fn fetch(&self) -> Result<Bytes> {
        let data = tokio::fs::read(&self.path).await?;
        Ok(Bytes::from(data))
    }
}

/// A fragment tagged by the caller
#[derive(Clone)]
pub struct TaggedFragment {
    /// 0 = video, 1 = audio
    pub track: u8,
    pub fragment: SequenceInfo,
    pub entry: Arc<dyn DataProvider>,
}

impl TaggedFragment {
    pub fn new(track: u8, sn: u64, cc: u32, entry: Arc<dyn DataProvider>) -> Self {
        Self {
            track,
            fragment: SequenceInfo::new(sn, cc),
            entry,
        }
    }
}

impl std::fmt::Debug for TaggedFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedFragment")
            .field("track", &self.track)
            .field("fragment", &self.fragment)
            .finish()
    }
}

/// Accepted input shapes
#[derive(Debug, Clone)]
pub enum FragmentSource {
    /// Pre-tagged fragments, possibly interleaving video and audio
    Tagged(Vec<TaggedFragment>),
    /// Ordered raw buffers of a single video track
    Raw(Vec<Bytes>),
}

/// Normalized fragment
#[derive(Clone)]
pub struct FragmentRecord {
    pub track: TrackKind,
    pub sequence: SequenceInfo,
    pub data: Arc<dyn DataProvider>,
}

impl FragmentRecord {
    pub async fn fetch(&self) -> Result<Bytes> {
        self.data.fetch().await
    }
}

impl std::fmt::Debug for FragmentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentRecord")
            .field("track", &self.track)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl FragmentSource {
    /// Convert into the ordered record list. Order is preserved exactly.
    pub fn into_records(self) -> Result<Vec<FragmentRecord>> {
        match self {
            FragmentSource::Tagged(fragments) => fragments
                .into_iter()
                .map(|f| {
                    let track = TrackKind::from_index(f.track).ok_or_else(|| {
                        RemuxError::InvalidInput(format!(
                            "fragment sn={} has unknown track index {}",
                            f.fragment.sn, f.track
                        ))
                    })?;
                    Ok(FragmentRecord {
                        track,
                        sequence: f.fragment,
                        data: f.entry,
                    })
                })
                .collect(),
            FragmentSource::Raw(buffers) => Ok(buffers
                .into_iter()
                .enumerate()
                .map(|(i, data)| FragmentRecord {
                    track: TrackKind::Video,
                    sequence: SequenceInfo::new(i as u64, 0),
                    data: Arc::new(data) as Arc<dyn DataProvider>,
                })
                .collect()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FragmentSource::Tagged(f) => f.len(),
            FragmentSource::Raw(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<Bytes>> for FragmentSource {
    fn from(buffers: Vec<Bytes>) -> Self {
        FragmentSource::Raw(buffers)
    }
}

impl From<Vec<TaggedFragment>> for FragmentSource {
    fn from(fragments: Vec<TaggedFragment>) -> Self {
        FragmentSource::Tagged(fragments)
    }
}
