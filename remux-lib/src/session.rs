//! Fast-path conversion session
//!
//! One session turns an ordered fragment list into a single MP4: ingest every
//! fragment, reconcile the timeline, serialize the init segment, then append
//! the stored chunk blobs in the order they were produced.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::assembler::TrackAssembler;
use crate::config::RemuxOptions;
use crate::error::{RemuxError, Result};
use crate::progress::{DiagnosticSink, ProgressSink};
use crate::serializer::{build_with_offsets, ContainerSerializer};
use crate::source::FragmentRecord;
use crate::store::{create_store, StoreGuard};
use crate::timeline::reconcile;
use crate::transmux::TransmuxerFactory;
use crate::types::{Movie, TrackKind};

/// A finished conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub mime_type: String,
    pub data: Bytes,
}

impl OutputArtifact {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct ConversionSession {
    assembler: TrackAssembler,
    guard: StoreGuard,
    serializer: Arc<dyn ContainerSerializer>,
    options: RemuxOptions,
    cancel: CancellationToken,
    progress: ProgressSink,
    diagnostics: Option<DiagnosticSink>,
}

impl ConversionSession {
    pub fn new(
        factory: Arc<dyn TransmuxerFactory>,
        serializer: Arc<dyn ContainerSerializer>,
        options: RemuxOptions,
        cancel: CancellationToken,
        progress: ProgressSink,
        diagnostics: Option<DiagnosticSink>,
    ) -> Result<Self> {
        let store = create_store(&options.store)?;
        Ok(Self {
            assembler: TrackAssembler::new(factory, diagnostics.clone()),
            guard: StoreGuard::new(store),
            serializer,
            options,
            cancel,
            progress,
            diagnostics,
        })
    }

    /// Tear down and report cancellation. The store is closed without grace.
    fn cancelled(mut self, at: usize) -> RemuxError {
        info!("Conversion cancelled before fragment {}", at);
        self.assembler.destroy();
        self.guard.close_now();
        RemuxError::Cancelled
    }

    /// Ingest `records` in order and produce the output artifact.
    pub async fn run(mut self, records: &[FragmentRecord]) -> Result<OutputArtifact> {
        let store = Arc::clone(self.guard.store());
        let total = records.len();

        for (i, record) in records.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(i));
            }
            let payload = record.fetch().await?;
            self.assembler.ingest(record, payload, store.as_ref()).await?;
            self.progress.report_step(i + 1, total);
        }
        if self.cancel.is_cancelled() {
            return Err(self.cancelled(total));
        }

        self.finalize().await
    }

    async fn finalize(self) -> Result<OutputArtifact> {
        let Self {
            assembler,
            guard,
            serializer,
            options,
            progress,
            diagnostics,
            ..
        } = self;

        let assembled = assembler.finish();
        let mut movie = reconcile(
            assembled.tracks,
            &assembled.expected,
            &options,
            diagnostics.as_ref(),
        )?;
        let init = build_with_offsets(serializer.as_ref(), &mut movie, diagnostics.as_ref())?;

        let blobs = guard.store().get_all(&assembled.blobs).await?;
        let mut data = BytesMut::with_capacity(init.len() + assembled.media_len as usize);
        data.extend_from_slice(&init);
        for blob in &blobs {
            data.extend_from_slice(blob);
        }
        debug!(
            "Output: {} byte init segment + {} media bytes in {} chunks",
            init.len(),
            assembled.media_len,
            blobs.len()
        );

        let mime_type = mime_type(&movie, &options);
        guard.release(options.store.release_grace());
        progress.complete();
        info!(
            "Merged {} tracks, {:.2}s, {} bytes, {} discontinuities",
            movie.tracks.len(),
            movie.duration_secs(),
            data.len(),
            assembled.discontinuities
        );

        Ok(OutputArtifact {
            mime_type,
            data: data.freeze(),
        })
    }
}

/// Output mime type with an RFC 6381 `codecs` parameter when one can be built
pub fn mime_type(movie: &Movie, options: &RemuxOptions) -> String {
    if let Some(explicit) = &options.mime_type {
        return explicit.clone();
    }
    let has_video = movie.tracks.iter().any(|t| t.kind == TrackKind::Video);
    let base = if has_video { "video/mp4" } else { "audio/mp4" };

    let codecs: Vec<String> = movie
        .tracks
        .iter()
        .filter_map(|t| {
            t.codec_string().or_else(|| match t.kind {
                TrackKind::Video => options.video_codec.clone(),
                TrackKind::Audio => options.audio_codec.clone(),
            })
        })
        .collect();
    if codecs.is_empty() {
        base.to_string()
    } else {
        format!("{}; codecs=\"{}\"", base, codecs.join(","))
    }
}
