//! Conversion strategy selection
//!
//! The structural merge is tried first. Only a failure classified as
//! recoverable hands the same fragments to a re-encode fallback, and only when
//! that fallback can decode and encode both stream kinds.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RemuxOptions;
use crate::error::{RecoverableReason, RemuxError, Result};
use crate::progress::{emit, DiagnosticEvent, DiagnosticSink, ProgressSink};
use crate::serializer::{ContainerSerializer, Mp4InitWriter};
use crate::session::{ConversionSession, OutputArtifact};
use crate::source::{FragmentRecord, FragmentSource};
use crate::transmux::{Fmp4TransmuxerFactory, TransmuxerFactory};
use crate::types::TrackKind;

/// Decode/encode primitives available to a re-encode fallback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub video_decode: bool,
    pub video_encode: bool,
    pub audio_decode: bool,
    pub audio_encode: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            video_decode: true,
            video_encode: true,
            audio_decode: true,
            audio_encode: true,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.video_decode && self.video_encode && self.audio_decode && self.audio_encode
    }

    /// Names of the absent primitives, for logging
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.video_decode, "video decode"),
            (self.video_encode, "video encode"),
            (self.audio_decode, "audio decode"),
            (self.audio_encode, "audio encode"),
        ]
        .into_iter()
        .filter(|(present, _)| !present)
        .map(|(_, name)| name)
        .collect()
    }
}

/// What the fallback receives: the fragments the merge saw plus the caller's hints
#[derive(Debug, Clone)]
pub struct FallbackRequest {
    pub mime_type: String,
    /// Duration hint in seconds
    pub duration: Option<f64>,
    pub fragments: Vec<FragmentRecord>,
}

/// Full decode and re-encode conversion, used when the structural merge cannot work
#[async_trait]
pub trait ReencodeFallback: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn convert(
        &self,
        request: FallbackRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<OutputArtifact>;
}

/// Where a conversion stands once the structural merge has returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConversionState {
    Succeeded,
    Failed,
    ReencodeFallback(RecoverableReason),
}

/// Entry point: merges fragments into one MP4, re-encoding when it must
pub struct Remuxer {
    factory: Arc<dyn TransmuxerFactory>,
    serializer: Arc<dyn ContainerSerializer>,
    fallback: Option<Arc<dyn ReencodeFallback>>,
    options: RemuxOptions,
    diagnostics: Option<DiagnosticSink>,
}

impl Remuxer {
    pub fn new(
        factory: Arc<dyn TransmuxerFactory>,
        serializer: Arc<dyn ContainerSerializer>,
    ) -> Self {
        Self {
            factory,
            serializer,
            fallback: None,
            options: RemuxOptions::default(),
            diagnostics: None,
        }
    }

    /// Remuxer for DASH/CMAF fragments with the built-in MP4 writer
    pub fn fmp4(factory: Fmp4TransmuxerFactory) -> Self {
        Self::new(Arc::new(factory), Arc::new(Mp4InitWriter::new()))
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ReencodeFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_options(mut self, options: RemuxOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticSink) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn options(&self) -> &RemuxOptions {
        &self.options
    }

    /// Convert `source` into a single MP4 artifact.
    ///
    /// Either the whole artifact is returned or a single error; nothing partial.
    pub async fn convert(
        &self,
        source: FragmentSource,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<OutputArtifact> {
        let records = source.into_records()?;
        debug!("Structural merge of {} fragments", records.len());

        let merged = match ConversionSession::new(
            Arc::clone(&self.factory),
            Arc::clone(&self.serializer),
            self.options.clone(),
            cancel.clone(),
            progress.clone(),
            self.diagnostics.clone(),
        ) {
            Ok(session) => session.run(&records).await,
            Err(e) => Err(e),
        };

        match (self.transition(&merged), merged) {
            (ConversionState::ReencodeFallback(reason), Err(err)) => {
                info!("Structural merge failed ({}): {}", reason, err);
                self.reencode(reason, records, progress, cancel).await
            }
            (_, result) => result,
        }
    }

    fn transition(&self, merged: &Result<OutputArtifact>) -> ConversionState {
        let err = match merged {
            Ok(_) => return ConversionState::Succeeded,
            Err(err) => err,
        };
        let Some(reason) = err.recoverable_reason() else {
            debug!("Merge error is not recoverable: {}", err);
            return ConversionState::Failed;
        };
        let Some(fallback) = &self.fallback else {
            debug!("No re-encode fallback configured, {} is final", reason);
            return ConversionState::Failed;
        };
        let capabilities = fallback.capabilities();
        if !capabilities.is_complete() {
            warn!(
                "Cannot re-encode after {} (missing {}), returning merge error",
                reason,
                capabilities.missing().join(", ")
            );
            return ConversionState::Failed;
        }
        ConversionState::ReencodeFallback(reason)
    }

    async fn reencode(
        &self,
        reason: RecoverableReason,
        records: Vec<FragmentRecord>,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<OutputArtifact> {
        let Some(fallback) = &self.fallback else {
            return Err(RemuxError::Fallback("no re-encode fallback configured".to_string()));
        };
        emit(
            self.diagnostics.as_ref(),
            DiagnosticEvent::FallbackEngaged { reason },
        );

        let request = FallbackRequest {
            mime_type: self.fallback_mime_type(&records),
            duration: self.options.duration,
            fragments: records,
        };
        fallback.convert(request, progress.fork(), cancel).await
    }

    fn fallback_mime_type(&self, records: &[FragmentRecord]) -> String {
        if let Some(explicit) = &self.options.mime_type {
            return explicit.clone();
        }
        if records.iter().all(|r| r.track == TrackKind::Audio) && !records.is_empty() {
            "audio/mp4".to_string()
        } else {
            "video/mp4".to_string()
        }
    }
}
