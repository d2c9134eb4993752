//! Bitstream transmuxer interface
//!
//! A transmuxer turns fragment payloads into per-stream sample runs. The
//! assembler owns one instance per fragment track tag and feeds it strictly
//! in input order.

pub mod fmp4;

use bytes::Bytes;

use crate::error::TransmuxError;
use crate::types::{CodecInfo, ParameterSets, Sample, TrackKind};

pub use fmp4::{Fmp4Transmuxer, Fmp4TransmuxerFactory};

/// Samples of one elementary stream extracted from a fragment
#[derive(Debug, Clone)]
pub struct TrackSegment {
    pub timescale: u32,
    pub codec: CodecInfo,
    /// Parameter sets seen with this fragment; may repeat earlier ones
    pub parameter_sets: ParameterSets,
    /// Decode time of the first sample in track ticks
    pub base_decode_time: i64,
    pub samples: Vec<Sample>,
    /// Sample payloads concatenated in decode order
    pub data: Bytes,
}

impl TrackSegment {
    pub fn kind(&self) -> TrackKind {
        self.codec.kind()
    }

    pub fn duration(&self) -> i64 {
        self.samples
            .iter()
            .fold(0i64, |total, s| total.saturating_add(s.duration as i64))
    }

    pub fn end_decode_time(&self) -> i64 {
        self.base_decode_time.saturating_add(self.duration())
    }

    /// Presentation time of the first sample
    pub fn start_pts(&self) -> i64 {
        let offset = self.samples.first().map_or(0, |s| s.composition_offset as i64);
        self.base_decode_time.saturating_add(offset)
    }

    /// Presentation time right after the last-presented sample
    pub fn end_pts(&self) -> i64 {
        let mut dts = self.base_decode_time;
        let mut end = self.base_decode_time;
        for s in &self.samples {
            let presented = dts
                .saturating_add(s.composition_offset as i64)
                .saturating_add(s.duration as i64);
            end = end.max(presented);
            dts = dts.saturating_add(s.duration as i64);
        }
        end
    }
}

/// Output of a single `push_data` call. A stream absent from the fragment is `None`.
#[derive(Debug, Clone, Default)]
pub struct TransmuxOutput {
    pub video: Option<TrackSegment>,
    pub audio: Option<TrackSegment>,
}

impl TransmuxOutput {
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    /// Streams in assembly order: video first, then audio
    pub fn into_segments(self) -> impl Iterator<Item = TrackSegment> {
        self.video.into_iter().chain(self.audio)
    }
}

pub trait Transmuxer: Send {
    /// Feed one fragment. `discontinuity` asks the transmuxer to drop any
    /// timing state carried over from the previous fragment.
    fn push_data(&mut self, data: Bytes, discontinuity: bool)
        -> Result<TransmuxOutput, TransmuxError>;

    /// Release internal buffers
    fn destroy(&mut self);
}

/// Creates one transmuxer per fragment track tag
pub trait TransmuxerFactory: Send + Sync {
    fn create(&self, track: TrackKind) -> Box<dyn Transmuxer>;
}
