use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::store::BlobHandle;

/// Length of the `mdat` box header written in front of every chunk payload
pub const MDAT_HEADER_LEN: u64 = 8;

/// Elementary stream kind. The numeric index matches the fragment tag (0 = video, 1 = audio).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(TrackKind::Video),
            1 => Some(TrackKind::Audio),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            TrackKind::Video => 0,
            TrackKind::Audio => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sequence number and continuity counter of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub sn: u64,
    pub cc: u32,
}

impl SequenceInfo {
    pub fn new(sn: u64, cc: u32) -> Self {
        Self { sn, cc }
    }

    /// Whether `self` directly continues `previous` without a break.
    pub fn continues(&self, previous: &SequenceInfo) -> bool {
        previous.sn.checked_add(1) == Some(self.sn) && previous.cc == self.cc
    }
}

/// One access unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Decode duration in track timescale ticks
    pub duration: u32,
    /// PTS - DTS in track timescale ticks
    pub composition_offset: i32,
    pub is_sync: bool,
    /// Payload size in bytes
    pub size: u32,
}

/// Static codec description of an elementary stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecInfo {
    /// H.264 video; SPS/PPS travel separately as parameter sets
    Avc { width: u16, height: u16 },
    /// AAC audio
    Aac {
        sample_rate: u32,
        channels: u16,
        audio_specific_config: Bytes,
    },
}

impl CodecInfo {
    pub fn kind(&self) -> TrackKind {
        match self {
            CodecInfo::Avc { .. } => TrackKind::Video,
            CodecInfo::Aac { .. } => TrackKind::Audio,
        }
    }

    /// RFC 6381 codec string, if the parameters allow inferring one.
    pub fn codec_string(&self, parameter_sets: &ParameterSets) -> Option<String> {
        match self {
            CodecInfo::Avc { .. } => {
                let sps = parameter_sets.sps.first()?;
                if sps.len() < 4 {
                    return None;
                }
                Some(format!("avc1.{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
            }
            CodecInfo::Aac {
                audio_specific_config,
                ..
            } => {
                let object_type = audio_specific_config.first()? >> 3;
                if object_type == 0 || object_type == 31 {
                    return None;
                }
                Some(format!("mp4a.40.{}", object_type))
            }
        }
    }
}

/// Codec parameter sets, deduplicated by value with insertion order kept
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl ParameterSets {
    /// Merge `other` into `self`, skipping byte-identical sets.
    /// Returns the number of sets added.
    pub fn merge(&mut self, other: &ParameterSets) -> usize {
        fn merge_list(into: &mut Vec<Bytes>, from: &[Bytes]) -> usize {
            let mut added = 0;
            for set in from {
                if !into.iter().any(|existing| existing == set) {
                    into.push(set.clone());
                    added += 1;
                }
            }
            added
        }
        merge_list(&mut self.sps, &other.sps) + merge_list(&mut self.pps, &other.pps)
    }

    pub fn is_empty(&self) -> bool {
        self.sps.is_empty() && self.pps.is_empty()
    }
}

/// One transmuxed fragment's output for a track
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 1-based, assigned in append order per track
    pub id: u32,
    pub samples: Vec<Sample>,
    /// Offset of the first sample relative to the end of the init segment
    pub relative_offset: u64,
    /// Offset of the first sample in the output file
    pub offset: u64,
    pub start_dts: i64,
    pub end_dts: i64,
    pub start_pts: i64,
    pub end_pts: i64,
    pub blob: BlobHandle,
    /// Stored blob length, `mdat` header included
    pub stored_len: u64,
}

/// Edit list entry. `media_time == -1` marks an empty edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditEntry {
    /// Duration in movie timescale ticks
    pub segment_duration: u64,
    /// Start in track timescale ticks, or -1
    pub media_time: i64,
}

impl EditEntry {
    pub fn empty(segment_duration: u64) -> Self {
        Self {
            segment_duration,
            media_time: -1,
        }
    }

    pub fn is_empty_edit(&self) -> bool {
        self.media_time == -1
    }
}

/// One elementary stream's accumulated state
#[derive(Debug, Clone)]
pub struct Track {
    /// 1-based container track id
    pub id: u32,
    pub kind: TrackKind,
    pub codec: CodecInfo,
    pub parameter_sets: ParameterSets,
    pub timescale: u32,
    pub movie_timescale: u32,
    pub chunks: Vec<Chunk>,
    /// Output byte position right after this track's last chunk
    pub end_offset: u64,
    pub edit_list: Vec<EditEntry>,
    /// Leading gap relative to the shared time origin, in track ticks
    pub padding: i64,
    /// Playable duration in track ticks, set by the timeline reconciler
    pub duration: u64,
    pub wide_offsets: bool,
    /// No composition-offset table is written when set
    pub omit_composition_offsets: bool,
}

impl Track {
    pub fn new(id: u32, codec: CodecInfo, timescale: u32) -> Self {
        Self {
            id,
            kind: codec.kind(),
            codec,
            parameter_sets: ParameterSets::default(),
            timescale,
            movie_timescale: timescale,
            chunks: Vec::new(),
            end_offset: 0,
            edit_list: Vec::new(),
            padding: 0,
            duration: 0,
            wide_offsets: false,
            omit_composition_offsets: false,
        }
    }

    pub fn first_chunk(&self) -> Option<&Chunk> {
        self.chunks.first()
    }

    pub fn last_chunk(&self) -> Option<&Chunk> {
        self.chunks.last()
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.chunks.iter().flat_map(|c| c.samples.iter())
    }

    pub fn has_composition_offsets(&self) -> bool {
        self.samples().any(|s| s.composition_offset != 0)
    }

    /// Duration in movie timescale ticks
    pub fn movie_duration(&self) -> u64 {
        rescale(self.duration, self.timescale, self.movie_timescale)
    }

    /// Restore every chunk offset to its provisional value
    pub fn reset_offsets(&mut self) {
        for chunk in &mut self.chunks {
            chunk.offset = chunk.relative_offset;
        }
    }

    /// Shift every chunk offset past an init segment of `base` bytes
    pub fn apply_offset_base(&mut self, base: u64) {
        for chunk in &mut self.chunks {
            chunk.offset = chunk.relative_offset + base;
        }
    }

    pub fn codec_string(&self) -> Option<String> {
        self.codec.codec_string(&self.parameter_sets)
    }
}

/// Reconciled tracks plus movie-level timing, ready for serialization
#[derive(Debug, Clone)]
pub struct Movie {
    pub timescale: u32,
    /// In movie timescale ticks
    pub duration: u64,
    pub tracks: Vec<Track>,
}

impl Movie {
    pub fn reset_offsets(&mut self) {
        for track in &mut self.tracks {
            track.reset_offsets();
        }
    }

    pub fn apply_offset_base(&mut self, base: u64) {
        for track in &mut self.tracks {
            track.apply_offset_base(base);
        }
    }

    pub fn set_wide_offsets(&mut self, wide: bool) {
        for track in &mut self.tracks {
            track.wide_offsets = wide;
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.duration as f64 / self.timescale as f64
    }
}

/// Convert `value` ticks from one timescale to another, rounding to nearest.
pub fn rescale(value: u64, from: u32, to: u32) -> u64 {
    if from == to || from == 0 {
        return value;
    }
    ((value as u128 * to as u128 + from as u128 / 2) / from as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind_index() {
        assert_eq!(TrackKind::from_index(0), Some(TrackKind::Video));
        assert_eq!(TrackKind::from_index(1), Some(TrackKind::Audio));
        assert_eq!(TrackKind::from_index(2), None);
        assert_eq!(TrackKind::Audio.index(), 1);
    }

    #[test]
    fn test_sequence_continuity() {
        let prev = SequenceInfo::new(4, 0);
        assert!(SequenceInfo::new(5, 0).continues(&prev));
        assert!(!SequenceInfo::new(6, 0).continues(&prev));
        assert!(!SequenceInfo::new(5, 1).continues(&prev));
    }

    #[test]
    fn test_parameter_set_merge_is_idempotent() {
        let incoming = ParameterSets {
            sps: vec![Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f])],
            pps: vec![Bytes::from_static(&[0x68, 0xee])],
        };
        let mut sets = ParameterSets::default();
        assert_eq!(sets.merge(&incoming), 2);
        // Same bytes in a fresh allocation
        let again = ParameterSets {
            sps: vec![Bytes::copy_from_slice(&[0x67, 0x64, 0x00, 0x1f])],
            pps: vec![Bytes::copy_from_slice(&[0x68, 0xee])],
        };
        assert_eq!(sets.merge(&again), 0);
        assert_eq!(sets.sps.len(), 1);
        assert_eq!(sets.pps.len(), 1);
    }

    #[test]
    fn test_codec_strings() {
        let sets = ParameterSets {
            sps: vec![Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f])],
            pps: vec![],
        };
        let avc = CodecInfo::Avc {
            width: 1280,
            height: 720,
        };
        assert_eq!(avc.codec_string(&sets).as_deref(), Some("avc1.64001f"));

        let aac = CodecInfo::Aac {
            sample_rate: 48000,
            channels: 2,
            audio_specific_config: Bytes::from_static(&[0x11, 0x90]),
        };
        assert_eq!(
            aac.codec_string(&ParameterSets::default()).as_deref(),
            Some("mp4a.40.2")
        );
        assert_eq!(avc.codec_string(&ParameterSets::default()), None);
    }

    #[test]
    fn test_rescale() {
        assert_eq!(rescale(90000, 90000, 1000), 1000);
        assert_eq!(rescale(1024, 48000, 90000), 1920);
        assert_eq!(rescale(5, 0, 1000), 5);
    }
}
