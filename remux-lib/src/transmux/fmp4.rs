//! Fragmented MP4 (DASH / CMAF) transmuxer
//!
//! Parses the `moov` of an init segment once, then extracts samples from each
//! `moof`/`mdat` pair. AVC payloads are already length-prefixed in fMP4, so the
//! sample bytes are passed through untouched.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::debug;

use super::{TrackSegment, Transmuxer, TransmuxerFactory, TransmuxOutput};
use crate::error::TransmuxError;
use crate::isobmff::{BoxIter, ByteReader, Mp4Box};
use crate::types::{CodecInfo, ParameterSets, Sample, TrackKind};

const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

/// `trex` defaults, overridable per fragment by `tfhd`
#[derive(Debug, Clone, Copy, Default)]
struct SampleDefaults {
    duration: u32,
    size: u32,
    flags: u32,
}

/// Static description of one `trak`
#[derive(Debug, Clone)]
struct TrackConfig {
    kind: TrackKind,
    timescale: u32,
    codec: CodecInfo,
    parameter_sets: ParameterSets,
    defaults: SampleDefaults,
}

pub struct Fmp4Transmuxer {
    /// Init segment supplied out of band, parsed on the first push
    pending_init: Option<Bytes>,
    tracks: HashMap<u32, TrackConfig>,
    /// Expected decode time of the next fragment, per track id
    next_decode_time: HashMap<u32, i64>,
}

impl Fmp4Transmuxer {
    pub fn new() -> Self {
        Self {
            pending_init: None,
            tracks: HashMap::new(),
            next_decode_time: HashMap::new(),
        }
    }

    /// Transmuxer primed with an init segment (`ftyp` + `moov`)
    pub fn with_init_segment(init: Bytes) -> Self {
        Self {
            pending_init: Some(init),
            ..Self::new()
        }
    }

    fn parse_init(&mut self, data: &[u8]) -> Result<(), TransmuxError> {
        let boxes = top_level_boxes(data)?;
        let moov = boxes
            .iter()
            .find(|b| &b.box_type == b"moov")
            .ok_or_else(|| TransmuxError::MissingBox("moov".to_string()))?;
        self.parse_moov(moov)
    }

    fn parse_moov(&mut self, moov: &Mp4Box<'_>) -> Result<(), TransmuxError> {
        let mut trex = HashMap::new();
        let mut parsed = Vec::new();

        for child in moov.children() {
            let child = child?;
            match &child.box_type {
                b"trak" => {
                    if let Some(track) = parse_trak(&child)? {
                        parsed.push(track);
                    }
                }
                b"mvex" => {
                    for b in child.children() {
                        let b = b?;
                        if &b.box_type == b"trex" {
                            let (id, defaults) = parse_trex(b.payload)?;
                            trex.insert(id, defaults);
                        }
                    }
                }
                _ => {}
            }
        }

        self.tracks.clear();
        for (id, mut config) in parsed {
            if let Some(defaults) = trex.get(&id) {
                config.defaults = *defaults;
            }
            debug!(
                "fMP4 track {}: {} timescale={} codec={:?}",
                id, config.kind, config.timescale, config.codec
            );
            self.tracks.insert(id, config);
        }
        Ok(())
    }

    fn parse_fragment(
        &mut self,
        data: &[u8],
        moof: &Mp4Box<'_>,
        output: &mut TransmuxOutput,
    ) -> Result<(), TransmuxError> {
        for traf in moof.children() {
            let traf = traf?;
            if &traf.box_type != b"traf" {
                continue;
            }
            self.parse_traf(data, moof.start, &traf, output)?;
        }
        Ok(())
    }

    fn parse_traf(
        &mut self,
        data: &[u8],
        moof_start: usize,
        traf: &Mp4Box<'_>,
        output: &mut TransmuxOutput,
    ) -> Result<(), TransmuxError> {
        let mut tfhd = None;
        let mut tfdt = None;
        let mut truns = Vec::new();
        for b in traf.children() {
            let b = b?;
            match &b.box_type {
                b"tfhd" => tfhd = Some(parse_tfhd(b.payload)?),
                b"tfdt" => tfdt = Some(parse_tfdt(b.payload)?),
                b"trun" => truns.push(b.payload),
                _ => {}
            }
        }
        let tfhd = tfhd.ok_or_else(|| TransmuxError::MissingBox("tfhd".to_string()))?;
        let config = self.tracks.get(&tfhd.track_id).ok_or_else(|| {
            TransmuxError::IncompleteState(format!(
                "fragment references track {} with no init segment",
                tfhd.track_id
            ))
        })?;

        let mut defaults = config.defaults;
        if let Some(d) = tfhd.default_duration {
            defaults.duration = d;
        }
        if let Some(s) = tfhd.default_size {
            defaults.size = s;
        }
        if let Some(f) = tfhd.default_flags {
            defaults.flags = f;
        }
        let base = tfhd.base_data_offset.unwrap_or(moof_start as u64);

        let mut samples = Vec::new();
        let mut payload = Vec::new();
        let mut cursor: Option<u64> = None;
        for trun in truns {
            let run = parse_trun(trun, &defaults, data.len())?;
            let mut pos = match run.data_offset {
                Some(off) => base.checked_add_signed(off as i64).ok_or_else(|| {
                    TransmuxError::MalformedBox(format!("trun data offset {} underflows", off))
                })?,
                None => cursor.unwrap_or(base),
            };
            for sample in &run.samples {
                let start = pos as usize;
                let end = start
                    .checked_add(sample.size as usize)
                    .filter(|end| *end <= data.len())
                    .ok_or_else(|| {
                        TransmuxError::MalformedBox(format!(
                            "sample at {}+{} exceeds fragment of {} bytes",
                            start,
                            sample.size,
                            data.len()
                        ))
                    })?;
                payload.extend_from_slice(&data[start..end]);
                pos += sample.size as u64;
            }
            cursor = Some(pos);
            samples.extend(run.samples);
        }

        let base_decode_time = match tfdt {
            Some(t) => t,
            None => self.next_decode_time.get(&tfhd.track_id).copied().unwrap_or(0),
        };
        let duration: i64 = samples.iter().map(|s| s.duration as i64).sum();
        let next_decode_time = base_decode_time.checked_add(duration).ok_or_else(|| {
            TransmuxError::MalformedBox(format!(
                "decode time {} + {} overflows",
                base_decode_time, duration
            ))
        })?;
        self.next_decode_time.insert(tfhd.track_id, next_decode_time);

        if samples.is_empty() {
            return Ok(());
        }

        let slot = match config.kind {
            TrackKind::Video => &mut output.video,
            TrackKind::Audio => &mut output.audio,
        };
        match slot {
            Some(existing) => {
                // Later trafs of the same stream continue the first one
                let mut data = Vec::with_capacity(existing.data.len() + payload.len());
                data.extend_from_slice(&existing.data);
                data.extend_from_slice(&payload);
                existing.data = Bytes::from(data);
                existing.samples.extend(samples);
            }
            None => {
                *slot = Some(TrackSegment {
                    timescale: config.timescale,
                    codec: config.codec.clone(),
                    parameter_sets: config.parameter_sets.clone(),
                    base_decode_time,
                    samples,
                    data: Bytes::from(payload),
                });
            }
        }
        Ok(())
    }
}

impl Default for Fmp4Transmuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transmuxer for Fmp4Transmuxer {
    fn push_data(
        &mut self,
        data: Bytes,
        discontinuity: bool,
    ) -> Result<TransmuxOutput, TransmuxError> {
        if let Some(init) = self.pending_init.take() {
            self.parse_init(&init)?;
        }
        if discontinuity {
            self.next_decode_time.clear();
        }

        let boxes = top_level_boxes(&data)?;
        let mut saw_structure = false;
        let mut output = TransmuxOutput::default();

        if let Some(moov) = boxes.iter().find(|b| &b.box_type == b"moov") {
            self.parse_moov(moov)?;
            saw_structure = true;
        }

        for moof in boxes.iter().filter(|b| &b.box_type == b"moof") {
            saw_structure = true;
            if self.tracks.is_empty() {
                return Err(TransmuxError::IncompleteState(
                    "media fragment before any init segment".to_string(),
                ));
            }
            let has_mdat = boxes
                .iter()
                .any(|b| &b.box_type == b"mdat" && b.start > moof.start);
            if !has_mdat {
                return Err(TransmuxError::MissingBox("mdat".to_string()));
            }
            self.parse_fragment(&data, moof, &mut output)?;
        }

        if !saw_structure {
            return Err(TransmuxError::WrongContainer(
                "no moov or moof box in fragment".to_string(),
            ));
        }
        Ok(output)
    }

    fn destroy(&mut self) {
        self.pending_init = None;
        self.tracks.clear();
        self.next_decode_time.clear();
    }
}

/// Creates [`Fmp4Transmuxer`]s, priming each with the init segment registered for its tag
#[derive(Debug, Clone, Default)]
pub struct Fmp4TransmuxerFactory {
    init_segments: HashMap<TrackKind, Bytes>,
}

impl Fmp4TransmuxerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_init_segment(mut self, track: TrackKind, init: Bytes) -> Self {
        self.init_segments.insert(track, init);
        self
    }
}

impl TransmuxerFactory for Fmp4TransmuxerFactory {
    fn create(&self, track: TrackKind) -> Box<dyn Transmuxer> {
        match self.init_segments.get(&track) {
            Some(init) => Box::new(Fmp4Transmuxer::with_init_segment(init.clone())),
            None => Box::new(Fmp4Transmuxer::new()),
        }
    }
}

/// Split a payload into its top-level boxes, telling a foreign container
/// apart from a damaged ISO BMFF one.
fn top_level_boxes(data: &[u8]) -> Result<Vec<Mp4Box<'_>>, TransmuxError> {
    if data.first() == Some(&0x47) && data.len() % 188 == 0 {
        return Err(TransmuxError::WrongContainer(
            "MPEG-TS payload given to the fMP4 transmuxer".to_string(),
        ));
    }
    let mut boxes = Vec::new();
    for b in BoxIter::new(data) {
        match b {
            Ok(b) => boxes.push(b),
            Err(e) if boxes.is_empty() => {
                return Err(TransmuxError::WrongContainer(format!(
                    "not an ISO BMFF payload: {}",
                    e
                )))
            }
            Err(e) => return Err(e),
        }
    }
    Ok(boxes)
}

fn parse_trak(trak: &Mp4Box<'_>) -> Result<Option<(u32, TrackConfig)>, TransmuxError> {
    let mut track_id = None;
    let mut timescale = None;
    let mut handler = None;
    let mut stsd = None;

    for b in trak.children() {
        let b = b?;
        match &b.box_type {
            b"tkhd" => {
                let mut r = ByteReader::new(b.payload, "tkhd");
                let (version, _) = r.version_flags()?;
                r.skip(if version == 1 { 16 } else { 8 })?;
                track_id = Some(r.u32()?);
            }
            b"mdia" => {
                for m in b.children() {
                    let m = m?;
                    match &m.box_type {
                        b"mdhd" => {
                            let mut r = ByteReader::new(m.payload, "mdhd");
                            let (version, _) = r.version_flags()?;
                            r.skip(if version == 1 { 16 } else { 8 })?;
                            timescale = Some(r.u32()?);
                        }
                        b"hdlr" => {
                            let mut r = ByteReader::new(m.payload, "hdlr");
                            r.skip(8)?;
                            let t = r.bytes(4)?;
                            handler = Some([t[0], t[1], t[2], t[3]]);
                        }
                        b"minf" => {
                            stsd = find_child(&m, &[b"stbl", b"stsd"])?;
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let kind = match handler.as_ref() {
        Some(b"vide") => TrackKind::Video,
        Some(b"soun") => TrackKind::Audio,
        Some(other) => {
            debug!("Skipping trak with handler '{}'", String::from_utf8_lossy(other));
            return Ok(None);
        }
        None => return Err(TransmuxError::MissingBox("hdlr".to_string())),
    };
    let track_id = track_id.ok_or_else(|| TransmuxError::MissingBox("tkhd".to_string()))?;
    let timescale = timescale
        .filter(|t| *t > 0)
        .ok_or_else(|| TransmuxError::MalformedBox("mdhd timescale missing or zero".to_string()))?;
    let stsd = stsd.ok_or_else(|| TransmuxError::MissingBox("stsd".to_string()))?;
    let (codec, parameter_sets) = parse_stsd(stsd)?;
    if codec.kind() != kind {
        return Err(TransmuxError::MalformedBox(format!(
            "{} handler with {:?} sample entry",
            kind, codec
        )));
    }

    Ok(Some((
        track_id,
        TrackConfig {
            kind,
            timescale,
            codec,
            parameter_sets,
            defaults: SampleDefaults::default(),
        },
    )))
}

fn find_child<'a>(
    parent: &Mp4Box<'a>,
    path: &[&[u8; 4]],
) -> Result<Option<&'a [u8]>, TransmuxError> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(Some(parent.payload));
    };
    for b in parent.children() {
        let b = b?;
        if &b.box_type == *first {
            return find_child(&b, rest);
        }
    }
    Ok(None)
}

fn parse_stsd(payload: &[u8]) -> Result<(CodecInfo, ParameterSets), TransmuxError> {
    let mut r = ByteReader::new(payload, "stsd");
    r.version_flags()?;
    let count = r.u32()?;
    if count == 0 {
        return Err(TransmuxError::MalformedBox("stsd has no entries".to_string()));
    }
    let entry = BoxIter::new(r.rest())
        .next()
        .ok_or_else(|| TransmuxError::MalformedBox("stsd entry missing".to_string()))??;

    match &entry.box_type {
        b"avc1" | b"avc3" => parse_avc_entry(entry.payload),
        b"mp4a" => parse_mp4a_entry(entry.payload),
        other => Err(TransmuxError::UnsupportedCodec(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

/// Visual sample entry header length before child boxes
const VISUAL_ENTRY_LEN: usize = 78;
/// Audio sample entry header length before child boxes
const AUDIO_ENTRY_LEN: usize = 28;

fn parse_avc_entry(payload: &[u8]) -> Result<(CodecInfo, ParameterSets), TransmuxError> {
    let mut r = ByteReader::new(payload, "avc1");
    r.skip(24)?;
    let width = r.u16()?;
    let height = r.u16()?;
    r.skip(VISUAL_ENTRY_LEN - 28)?;

    let avcc = BoxIter::new(r.rest())
        .map_while(|b| b.ok())
        .find(|b| &b.box_type == b"avcC")
        .ok_or_else(|| TransmuxError::MissingBox("avcC".to_string()))?;

    let mut r = ByteReader::new(avcc.payload, "avcC");
    r.skip(4)?;
    let length_size = (r.u8()? & 0x03) + 1;
    if length_size != 4 {
        return Err(TransmuxError::UnsupportedCodec(format!(
            "avc1 with {}-byte NAL lengths",
            length_size
        )));
    }
    let mut sets = ParameterSets::default();
    let sps_count = r.u8()? & 0x1f;
    for _ in 0..sps_count {
        let len = r.u16()? as usize;
        sets.sps.push(Bytes::copy_from_slice(r.bytes(len)?));
    }
    let pps_count = r.u8()?;
    for _ in 0..pps_count {
        let len = r.u16()? as usize;
        sets.pps.push(Bytes::copy_from_slice(r.bytes(len)?));
    }
    Ok((CodecInfo::Avc { width, height }, sets))
}

fn parse_mp4a_entry(payload: &[u8]) -> Result<(CodecInfo, ParameterSets), TransmuxError> {
    let mut r = ByteReader::new(payload, "mp4a");
    r.skip(16)?;
    let channels = r.u16()?;
    r.skip(6)?;
    let sample_rate = r.u32()? >> 16;
    debug_assert_eq!(r.position(), AUDIO_ENTRY_LEN);

    let esds = BoxIter::new(r.rest())
        .map_while(|b| b.ok())
        .find(|b| &b.box_type == b"esds")
        .ok_or_else(|| TransmuxError::MissingBox("esds".to_string()))?;
    let audio_specific_config = parse_esds(esds.payload)?;

    Ok((
        CodecInfo::Aac {
            sample_rate,
            channels,
            audio_specific_config,
        },
        ParameterSets::default(),
    ))
}

fn read_descr_length(r: &mut ByteReader<'_>) -> Result<usize, TransmuxError> {
    let mut len = 0usize;
    for _ in 0..4 {
        let b = r.u8()?;
        len = (len << 7) | (b & 0x7f) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok(len)
}

/// Extract the AudioSpecificConfig from an `esds` payload
fn parse_esds(payload: &[u8]) -> Result<Bytes, TransmuxError> {
    let mut r = ByteReader::new(payload, "esds");
    r.version_flags()?;

    if r.u8()? != 0x03 {
        return Err(TransmuxError::MalformedBox("esds without ES_Descriptor".to_string()));
    }
    read_descr_length(&mut r)?;
    r.skip(2)?;
    let flags = r.u8()?;
    if flags & 0x80 != 0 {
        r.skip(2)?;
    }
    if flags & 0x40 != 0 {
        let url_len = r.u8()? as usize;
        r.skip(url_len)?;
    }
    if flags & 0x20 != 0 {
        r.skip(2)?;
    }

    if r.u8()? != 0x04 {
        return Err(TransmuxError::MalformedBox(
            "esds without DecoderConfigDescriptor".to_string(),
        ));
    }
    read_descr_length(&mut r)?;
    let object_type = r.u8()?;
    if object_type != 0x40 {
        return Err(TransmuxError::UnsupportedCodec(format!(
            "mp4a object type 0x{:02x}",
            object_type
        )));
    }
    r.skip(12)?;

    if r.u8()? != 0x05 {
        return Err(TransmuxError::MalformedBox(
            "esds without DecoderSpecificInfo".to_string(),
        ));
    }
    let len = read_descr_length(&mut r)?;
    Ok(Bytes::copy_from_slice(r.bytes(len)?))
}

fn parse_trex(payload: &[u8]) -> Result<(u32, SampleDefaults), TransmuxError> {
    let mut r = ByteReader::new(payload, "trex");
    r.version_flags()?;
    let track_id = r.u32()?;
    r.skip(4)?;
    Ok((
        track_id,
        SampleDefaults {
            duration: r.u32()?,
            size: r.u32()?,
            flags: r.u32()?,
        },
    ))
}

#[derive(Debug, Default)]
struct TrackFragmentHeader {
    track_id: u32,
    base_data_offset: Option<u64>,
    default_duration: Option<u32>,
    default_size: Option<u32>,
    default_flags: Option<u32>,
}

fn parse_tfhd(payload: &[u8]) -> Result<TrackFragmentHeader, TransmuxError> {
    let mut r = ByteReader::new(payload, "tfhd");
    let (_, flags) = r.version_flags()?;
    let mut h = TrackFragmentHeader {
        track_id: r.u32()?,
        ..Default::default()
    };
    if flags & 0x01 != 0 {
        h.base_data_offset = Some(r.u64()?);
    }
    if flags & 0x02 != 0 {
        r.skip(4)?;
    }
    if flags & 0x08 != 0 {
        h.default_duration = Some(r.u32()?);
    }
    if flags & 0x10 != 0 {
        h.default_size = Some(r.u32()?);
    }
    if flags & 0x20 != 0 {
        h.default_flags = Some(r.u32()?);
    }
    Ok(h)
}

fn parse_tfdt(payload: &[u8]) -> Result<i64, TransmuxError> {
    let mut r = ByteReader::new(payload, "tfdt");
    let (version, _) = r.version_flags()?;
    let time = if version == 1 { r.u64()? } else { r.u32()? as u64 };
    i64::try_from(time)
        .map_err(|_| TransmuxError::MalformedBox(format!("tfdt decode time {} out of range", time)))
}

struct TrackRun {
    data_offset: Option<i32>,
    samples: Vec<Sample>,
}

/// `fragment_len` bounds the sample count when sizes come from the defaults.
fn parse_trun(
    payload: &[u8],
    defaults: &SampleDefaults,
    fragment_len: usize,
) -> Result<TrackRun, TransmuxError> {
    let mut r = ByteReader::new(payload, "trun");
    let (_, flags) = r.version_flags()?;
    let count = r.u32()? as usize;
    let data_offset = if flags & 0x001 != 0 { Some(r.i32()?) } else { None };
    let first_flags = if flags & 0x004 != 0 { Some(r.u32()?) } else { None };

    let per_sample = [0x100, 0x200, 0x400, 0x800]
        .iter()
        .filter(|f| flags & **f != 0)
        .count();
    if r.remaining() < count.saturating_mul(per_sample * 4) {
        return Err(TransmuxError::MalformedBox(format!(
            "trun declares {} samples, payload too short",
            count
        )));
    }
    if flags & 0x200 == 0 {
        let needed = count.saturating_mul((defaults.size as usize).max(1));
        if needed > fragment_len {
            return Err(TransmuxError::MalformedBox(format!(
                "trun declares {} samples of {} bytes in a {} byte fragment",
                count, defaults.size, fragment_len
            )));
        }
    }

    let mut samples = Vec::with_capacity(count.min(r.remaining() / 4 + 1));
    for i in 0..count {
        let duration = if flags & 0x100 != 0 { r.u32()? } else { defaults.duration };
        let size = if flags & 0x200 != 0 { r.u32()? } else { defaults.size };
        let sample_flags = if flags & 0x400 != 0 {
            r.u32()?
        } else if i == 0 {
            first_flags.unwrap_or(defaults.flags)
        } else {
            defaults.flags
        };
        let composition_offset = if flags & 0x800 != 0 { r.i32()? } else { 0 };
        samples.push(Sample {
            duration,
            composition_offset,
            is_sync: sample_flags & SAMPLE_IS_NON_SYNC == 0,
            size,
        });
    }
    Ok(TrackRun {
        data_offset,
        samples,
    })
}
