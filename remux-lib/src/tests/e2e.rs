//! End-to-end conversion tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{RemuxOptions, StoreConfig};
use crate::error::{RemuxError, Result, TransmuxError};
use crate::isobmff::{find_box, BoxIter, ByteReader};
use crate::progress::{DiagnosticEvent, DiagnosticSink, ProgressSink};
use crate::serializer::{build_with_offsets, Mp4InitWriter};
use crate::session::OutputArtifact;
use crate::source::{DataProvider, FragmentSource, TaggedFragment};
use crate::store::BlobHandle;
use crate::strategy::{Capabilities, FallbackRequest, ReencodeFallback, Remuxer};
use crate::tests::fixtures::*;
use crate::transmux::Fmp4TransmuxerFactory;
use crate::types::{Chunk, CodecInfo, Movie, ParameterSets, Sample, SequenceInfo, Track, TrackKind};

fn memory_options() -> RemuxOptions {
    RemuxOptions::default().with_store(StoreConfig::memory())
}

fn spill_options(dir: &std::path::Path) -> RemuxOptions {
    RemuxOptions::default().with_store(StoreConfig {
        spill_dir: Some(dir.to_path_buf()),
        ..Default::default()
    })
}

fn video_remuxer() -> Remuxer {
    Remuxer::fmp4(
        Fmp4TransmuxerFactory::new().with_init_segment(TrackKind::Video, avc_init_segment()),
    )
    .with_options(memory_options())
}

fn av_remuxer() -> Remuxer {
    Remuxer::new(fmp4_factory(), Arc::new(Mp4InitWriter::new())).with_options(memory_options())
}

async fn convert(remuxer: &Remuxer, source: impl Into<FragmentSource>) -> Result<OutputArtifact> {
    remuxer
        .convert(source.into(), ProgressSink::noop(), CancellationToken::new())
        .await
}

fn dir_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Number of entries in the `elst` of every track
fn edit_counts(data: &[u8]) -> Vec<u32> {
    let moov = find_box(data, &[b"moov"]).unwrap();
    BoxIter::new(moov)
        .map_while(|b| b.ok())
        .filter(|b| &b.box_type == b"trak")
        .map(|trak| {
            let elst = find_box(trak.payload, &[b"edts", b"elst"]).unwrap();
            let mut r = ByteReader::new(elst, "elst");
            r.version_flags().unwrap();
            r.u32().unwrap()
        })
        .collect()
}

struct MockFallback {
    capabilities: Capabilities,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<(TrackKind, SequenceInfo)>>>,
}

impl MockFallback {
    fn new(capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReencodeFallback for MockFallback {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn convert(
        &self,
        request: FallbackRequest,
        progress: ProgressSink,
        _cancel: CancellationToken,
    ) -> Result<OutputArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(
            request
                .fragments
                .iter()
                .map(|f| (f.track, f.sequence))
                .collect(),
        );
        progress.complete();
        Ok(OutputArtifact {
            mime_type: request.mime_type,
            data: Bytes::from_static(b"reencoded"),
        })
    }
}

/// Provider that fails every fetch
struct FailingProvider;

#[async_trait]
impl DataProvider for FailingProvider {
    async fn fetch(&self) -> Result<Bytes> {
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "segment fetch failed").into())
    }
}

/// Provider that counts fetches and cancels the conversion when asked to
struct CountingProvider {
    data: Bytes,
    fetches: Arc<AtomicUsize>,
    cancel: Option<CancellationToken>,
}

#[async_trait]
impl DataProvider for CountingProvider {
    async fn fetch(&self) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel {
            token.cancel();
        }
        Ok(self.data.clone())
    }
}

#[tokio::test]
async fn test_raw_video_fragments_merge() {
    let specs: Vec<FragmentSpec> = (0..5).map(|sn| video_spec(sn, 4)).collect();
    let buffers: Vec<Bytes> = specs.iter().map(video_fragment).collect();

    let diagnostics = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let diagnostics = Arc::clone(&diagnostics);
        DiagnosticSink::new(move |e: &DiagnosticEvent| diagnostics.lock().push(e.clone()))
    };
    let remuxer = video_remuxer().with_diagnostics(sink);
    let artifact = convert(&remuxer, buffers).await.unwrap();

    assert!(diagnostics
        .lock()
        .iter()
        .all(|e| !matches!(e, DiagnosticEvent::Discontinuity { .. })));
    assert!(artifact.mime_type.starts_with("video/mp4"));

    let data = &artifact.data;
    let init_len = init_segment_len(data);
    let payload_len: usize = specs.iter().map(|s| s.payload().len()).sum();
    assert_eq!(data.len(), init_len + payload_len + 5 * 8);

    let offsets = chunk_offsets(data);
    assert_eq!(offsets.len(), 1);
    assert_eq!(offsets[0].len(), 5);
    for (spec, offset) in specs.iter().zip(&offsets[0]) {
        let offset = *offset as usize;
        assert_eq!(&data[offset - 4..offset], b"mdat");
        let payload = spec.payload();
        assert_eq!(&data[offset..offset + payload.len()], payload.as_slice());
    }
}

#[tokio::test]
async fn test_sequence_gap_counts_one_discontinuity() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let events = Arc::clone(&events);
        DiagnosticSink::new(move |e: &DiagnosticEvent| {
            if matches!(e, DiagnosticEvent::Discontinuity { .. }) {
                events.lock().push(e.clone());
            }
        })
    };
    let remuxer = av_remuxer().with_diagnostics(sink);
    let fragments = vec![tagged_video(0, 0, 2), tagged_video(1, 0, 2), tagged_video(3, 0, 2)];
    let artifact = convert(&remuxer, fragments).await.unwrap();

    assert!(!artifact.is_empty());
    let events = events.lock();
    assert_eq!(events.len(), 1);
    match &events[0] {
        DiagnosticEvent::Discontinuity {
            track,
            previous,
            current,
        } => {
            assert_eq!(*track, TrackKind::Video);
            assert_eq!(previous.sn, 1);
            assert_eq!(current.sn, 3);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_interleaved_tracks_with_late_audio() {
    // audio starts half a second after video
    let late_audio = |sn: u64| {
        let mut spec = audio_spec(sn, 8);
        spec.base_decode_time += AUDIO_TIMESCALE as u64 / 2;
        let data: Arc<dyn DataProvider> = Arc::new(audio_fragment(&spec));
        TaggedFragment::new(1, sn, 0, data)
    };
    let fragments = vec![
        tagged_video(0, 0, 10),
        late_audio(0),
        tagged_video(1, 0, 10),
        late_audio(1),
    ];
    let artifact = convert(&av_remuxer(), fragments).await.unwrap();

    assert_eq!(
        artifact.mime_type,
        "video/mp4; codecs=\"avc1.64001e,mp4a.40.2\""
    );
    assert_eq!(edit_counts(&artifact.data), vec![1, 2]);

    // chunks interleave in input order
    let offsets = chunk_offsets(&artifact.data);
    assert_eq!(offsets.len(), 2);
    assert!(offsets[0][0] < offsets[1][0]);
    assert!(offsets[1][0] < offsets[0][1]);
    assert!(offsets[0][1] < offsets[1][1]);
}

#[tokio::test]
async fn test_same_input_same_output() {
    let fragments = || {
        vec![
            tagged_video(0, 0, 3),
            tagged_audio(0, 0, 5),
            tagged_video(1, 0, 3),
            tagged_audio(1, 0, 5),
        ]
    };
    let remuxer = av_remuxer();
    let first = convert(&remuxer, fragments()).await.unwrap();
    let second = convert(&remuxer, fragments()).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_wrong_container_uses_fallback() {
    let fallback = MockFallback::new(Capabilities::all());
    let remuxer = video_remuxer().with_fallback(fallback.clone());
    let ts = Bytes::from(vec![0x47u8; 188 * 4]);

    let artifact = convert(&remuxer, vec![ts.clone(), ts]).await.unwrap();

    assert_eq!(artifact.data, Bytes::from_static(b"reencoded"));
    assert_eq!(artifact.mime_type, "video/mp4");
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    let requests = fallback.requests.lock();
    assert_eq!(
        requests[0],
        vec![
            (TrackKind::Video, SequenceInfo::new(0, 0)),
            (TrackKind::Video, SequenceInfo::new(1, 0)),
        ]
    );
}

#[tokio::test]
async fn test_missing_capability_returns_merge_error() {
    let fallback = MockFallback::new(Capabilities {
        video_encode: false,
        ..Capabilities::all()
    });
    let remuxer = video_remuxer().with_fallback(fallback.clone());
    let ts = Bytes::from(vec![0x47u8; 188 * 2]);

    let err = convert(&remuxer, vec![ts]).await.unwrap_err();

    assert!(matches!(
        err,
        RemuxError::Transmux(TransmuxError::WrongContainer(_))
    ));
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fetch_failure_is_not_recovered() {
    let fallback = MockFallback::new(Capabilities::all());
    let remuxer = av_remuxer().with_fallback(fallback.clone());
    let fragments = vec![
        tagged_video(0, 0, 2),
        TaggedFragment::new(0, 1, 0, Arc::new(FailingProvider)),
    ];

    let err = convert(&remuxer, fragments).await.unwrap_err();

    assert!(matches!(err, RemuxError::Io(_)));
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_audio_without_samples_is_missing_data() {
    let fallback = MockFallback::new(Capabilities::all());
    let remuxer = Remuxer::fmp4(
        Fmp4TransmuxerFactory::new().with_init_segment(TrackKind::Video, avc_init_segment()),
    )
    .with_options(memory_options())
    .with_fallback(fallback.clone());
    // the audio tag only ever carries its init segment
    let init: Arc<dyn DataProvider> = Arc::new(aac_init_segment());
    let fragments = vec![
        tagged_video(0, 0, 2),
        TaggedFragment::new(1, 0, 0, init),
        tagged_video(1, 0, 2),
    ];

    let err = convert(&remuxer, fragments).await.unwrap_err();

    assert!(matches!(err, RemuxError::MissingTrackData(_)));
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_stops_fetching() {
    let parent = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let fetches = Arc::new(AtomicUsize::new(0));
    let fragments: Vec<TaggedFragment> = (0..5u64)
        .map(|sn| {
            let provider = CountingProvider {
                data: video_fragment(&video_spec(sn, 2)),
                fetches: Arc::clone(&fetches),
                // cancel while the second fragment is being fetched
                cancel: (sn == 1).then(|| cancel.clone()),
            };
            TaggedFragment::new(0, sn, 0, Arc::new(provider))
        })
        .collect();

    let fallback = MockFallback::new(Capabilities::all());
    let remuxer = av_remuxer()
        .with_options(spill_options(parent.path()))
        .with_fallback(fallback.clone());
    let err = remuxer
        .convert(fragments.into(), ProgressSink::noop(), cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    assert_eq!(dir_entries(parent.path()), 0);
}

#[tokio::test]
async fn test_spill_store_removed_after_success() {
    let parent = tempfile::tempdir().unwrap();
    let remuxer = av_remuxer().with_options(spill_options(parent.path()));
    let fragments: Vec<TaggedFragment> = (0..3).map(|sn| tagged_video(sn, 0, 2)).collect();

    let artifact = convert(&remuxer, fragments).await.unwrap();

    assert!(!artifact.is_empty());
    assert_eq!(dir_entries(parent.path()), 0);
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let progress = {
        let seen = Arc::clone(&seen);
        ProgressSink::new(move |p| seen.lock().push(p))
    };
    let fragments: Vec<TaggedFragment> = (0..7).map(|sn| tagged_video(sn, 0, 1)).collect();
    av_remuxer()
        .convert(fragments.into(), progress, CancellationToken::new())
        .await
        .unwrap();

    let seen = seen.lock();
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last(), Some(&100));
    assert!(seen[..seen.len() - 1].iter().all(|p| *p < 100));
}

#[test]
fn test_wide_offsets_with_mp4_writer() {
    let base = u32::MAX as u64 + 1000;
    let mut track = Track::new(
        1,
        CodecInfo::Avc {
            width: 320,
            height: 240,
        },
        VIDEO_TIMESCALE,
    );
    track.parameter_sets = ParameterSets {
        sps: vec![Bytes::from_static(SPS)],
        pps: vec![Bytes::from_static(PPS)],
    };
    for (i, rel) in [8, base, base + 500].into_iter().enumerate() {
        track.chunks.push(Chunk {
            id: i as u32 + 1,
            samples: vec![Sample {
                duration: VIDEO_SAMPLE_DURATION,
                composition_offset: 0,
                is_sync: i == 0,
                size: 100,
            }],
            relative_offset: rel,
            offset: rel,
            start_dts: 0,
            end_dts: 0,
            start_pts: 0,
            end_pts: 0,
            blob: BlobHandle::new(),
            stored_len: 108,
        });
    }
    let mut movie = Movie {
        timescale: VIDEO_TIMESCALE,
        duration: 3 * VIDEO_SAMPLE_DURATION as u64,
        tracks: vec![track],
    };

    let retries = Arc::new(AtomicUsize::new(0));
    let sink = {
        let retries = Arc::clone(&retries);
        DiagnosticSink::new(move |e: &DiagnosticEvent| {
            if matches!(e, DiagnosticEvent::WideOffsetRetry { .. }) {
                retries.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    let init = build_with_offsets(&Mp4InitWriter::new(), &mut movie, Some(&sink)).unwrap();

    assert_eq!(retries.load(Ordering::SeqCst), 1);
    assert!(movie.tracks[0].wide_offsets);
    let stbl = find_box(&init, &[b"moov", b"trak", b"mdia", b"minf", b"stbl"]).unwrap();
    assert!(find_box(stbl, &[b"co64"]).is_some());
    assert!(find_box(stbl, &[b"stco"]).is_none());
    for chunk in &movie.tracks[0].chunks {
        assert_eq!(chunk.offset, chunk.relative_offset + init.len() as u64);
    }
    assert_eq!(
        chunk_offsets(&init)[0],
        movie.tracks[0].chunks.iter().map(|c| c.offset).collect::<Vec<_>>()
    );
}
