//! Track assembler
//!
//! Routes each fragment through the transmuxer owned by its track tag and
//! accumulates the resulting samples into per-stream [`Track`]s. Sample bytes
//! go straight to the blob store; tracks keep only chunk metadata.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{RemuxError, Result, TransmuxError};
use crate::progress::{emit, DiagnosticEvent, DiagnosticSink};
use crate::source::FragmentRecord;
use crate::store::{BlobHandle, BlobStore};
use crate::transmux::{TrackSegment, Transmuxer, TransmuxerFactory};
use crate::types::{Chunk, SequenceInfo, Track, TrackKind, MDAT_HEADER_LEN};

/// What a single `ingest` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub discontinuity: bool,
    /// Chunks appended, one per stream present in the fragment
    pub chunks: usize,
}

/// Result of assembly, handed to the timeline reconciler
#[derive(Debug)]
pub struct AssembledTracks {
    /// Tracks in output order (video before audio), ids 1..=n
    pub tracks: Vec<Track>,
    /// Track tags that appeared in the input
    pub expected: Vec<TrackKind>,
    /// Chunk blobs in append order
    pub blobs: Vec<BlobHandle>,
    /// Output bytes following the init segment
    pub media_len: u64,
    pub discontinuities: usize,
}

pub struct TrackAssembler {
    factory: Arc<dyn TransmuxerFactory>,
    transmuxers: HashMap<TrackKind, Box<dyn Transmuxer>>,
    last_sequence: HashMap<TrackKind, SequenceInfo>,
    tracks: HashMap<TrackKind, Track>,
    seen: BTreeSet<TrackKind>,
    blobs: Vec<BlobHandle>,
    /// Output byte position after the last appended blob, relative to the end of the init segment
    cursor: u64,
    discontinuities: usize,
    diagnostics: Option<DiagnosticSink>,
}

impl TrackAssembler {
    pub fn new(factory: Arc<dyn TransmuxerFactory>, diagnostics: Option<DiagnosticSink>) -> Self {
        Self {
            factory,
            transmuxers: HashMap::new(),
            last_sequence: HashMap::new(),
            tracks: HashMap::new(),
            seen: BTreeSet::new(),
            blobs: Vec::new(),
            cursor: 0,
            discontinuities: 0,
            diagnostics,
        }
    }

    pub fn discontinuities(&self) -> usize {
        self.discontinuities
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.get(&kind)
    }

    /// Detect a break against the previous fragment of the same tag.
    /// The first fragment of a tag is a reset hint for the transmuxer, not a logged break.
    fn check_sequence(&mut self, record: &FragmentRecord) -> (bool, bool) {
        match self.last_sequence.insert(record.track, record.sequence) {
            None => (true, false),
            Some(previous) if record.sequence.continues(&previous) => (false, false),
            Some(previous) => {
                warn!(
                    "Discontinuity on {} track: sn {} cc {} -> sn {} cc {}",
                    record.track,
                    previous.sn,
                    previous.cc,
                    record.sequence.sn,
                    record.sequence.cc
                );
                self.discontinuities += 1;
                emit(
                    self.diagnostics.as_ref(),
                    DiagnosticEvent::Discontinuity {
                        track: record.track,
                        previous,
                        current: record.sequence,
                    },
                );
                (true, true)
            }
        }
    }

    /// Feed one fragment's payload. Fragments must arrive in input order.
    pub async fn ingest(
        &mut self,
        record: &FragmentRecord,
        payload: Bytes,
        store: &dyn BlobStore,
    ) -> Result<IngestReport> {
        self.seen.insert(record.track);
        let (reset, discontinuity) = self.check_sequence(record);

        let factory = &self.factory;
        let transmuxer = self
            .transmuxers
            .entry(record.track)
            .or_insert_with(|| factory.create(record.track));
        let output = transmuxer.push_data(payload, reset)?;

        let mut report = IngestReport {
            discontinuity,
            chunks: 0,
        };
        for segment in output.into_segments() {
            self.append(segment, store).await?;
            report.chunks += 1;
        }
        Ok(report)
    }

    async fn append(&mut self, segment: TrackSegment, store: &dyn BlobStore) -> Result<()> {
        if segment.samples.is_empty() {
            return Ok(());
        }
        let kind = segment.kind();
        let track = self
            .tracks
            .entry(kind)
            .or_insert_with(|| Track::new(0, segment.codec.clone(), segment.timescale));

        if track.timescale != segment.timescale {
            return Err(TransmuxError::MalformedBox(format!(
                "{} timescale changed from {} to {}",
                kind, track.timescale, segment.timescale
            ))
            .into());
        }
        let added = track.parameter_sets.merge(&segment.parameter_sets);
        if added > 0 && !track.chunks.is_empty() {
            debug!("{} track gained {} parameter sets", kind, added);
        }

        let blob_len = segment.data.len() as u64 + MDAT_HEADER_LEN;
        if blob_len > u32::MAX as u64 {
            return Err(RemuxError::ChunkTooLarge(blob_len));
        }
        let mut blob = BytesMut::with_capacity(blob_len as usize);
        blob.put_u32(blob_len as u32);
        blob.put_slice(b"mdat");
        blob.put_slice(&segment.data);
        let handle = store.save(blob.freeze()).await?;

        let offset = self.cursor + MDAT_HEADER_LEN;
        self.cursor += blob_len;

        let chunk = Chunk {
            id: track.chunks.len() as u32 + 1,
            relative_offset: offset,
            offset,
            start_dts: segment.base_decode_time,
            end_dts: segment.end_decode_time(),
            start_pts: segment.start_pts(),
            end_pts: segment.end_pts(),
            samples: segment.samples,
            blob: handle,
            stored_len: blob_len,
        };
        debug!(
            "{} chunk {}: {} samples, dts {}..{}, offset {}",
            kind,
            chunk.id,
            chunk.samples.len(),
            chunk.start_dts,
            chunk.end_dts,
            chunk.offset
        );
        track.chunks.push(chunk);
        track.end_offset = self.cursor;
        self.blobs.push(handle);
        Ok(())
    }

    /// Release transmuxers and accumulated track state
    pub fn destroy(&mut self) {
        for transmuxer in self.transmuxers.values_mut() {
            transmuxer.destroy();
        }
        self.transmuxers.clear();
        self.tracks.clear();
        self.blobs.clear();
    }

    /// Stop ingesting and hand the tracks over for reconciliation
    pub fn finish(mut self) -> AssembledTracks {
        for transmuxer in self.transmuxers.values_mut() {
            transmuxer.destroy();
        }
        let mut tracks: Vec<Track> = [TrackKind::Video, TrackKind::Audio]
            .into_iter()
            .filter_map(|kind| self.tracks.remove(&kind))
            .collect();
        for (i, track) in tracks.iter_mut().enumerate() {
            track.id = i as u32 + 1;
        }
        AssembledTracks {
            tracks,
            expected: self.seen.iter().copied().collect(),
            blobs: std::mem::take(&mut self.blobs),
            media_len: self.cursor,
            discontinuities: self.discontinuities,
        }
    }
}
