//! Non-fragmented MP4 init segment writer (`ftyp` + `moov`)
//!
//! All header boxes use version 1 (64-bit times) with zero creation and
//! modification times, so the output depends on the movie alone.

use bytes::{BufMut, Bytes};

use super::ContainerSerializer;
use crate::error::SerializeError;
use crate::isobmff::{write_box, write_container_box, write_full_box};
use crate::types::{CodecInfo, EditEntry, Movie, ParameterSets, Sample, Track, TrackKind};

/// Reference [`ContainerSerializer`] producing ISO BMFF with `stco`/`co64` chunk offsets
#[derive(Debug, Clone, Default)]
pub struct Mp4InitWriter;

impl Mp4InitWriter {
    pub fn new() -> Self {
        Self
    }
}

impl ContainerSerializer for Mp4InitWriter {
    fn build_init_segment(&self, movie: &Movie) -> Result<Bytes, SerializeError> {
        let mut out = write_ftyp()?;
        out.extend_from_slice(&write_moov(movie)?);
        Ok(Bytes::from(out))
    }
}

fn write_ftyp() -> Result<Vec<u8>, SerializeError> {
    let mut content = Vec::with_capacity(24);
    content.extend_from_slice(b"isom");
    content.put_u32(0x200);
    content.extend_from_slice(b"isom");
    content.extend_from_slice(b"iso2");
    content.extend_from_slice(b"avc1");
    content.extend_from_slice(b"mp41");
    write_box(b"ftyp", &content)
}

fn write_moov(movie: &Movie) -> Result<Vec<u8>, SerializeError> {
    let mvhd = write_mvhd(movie)?;
    let mut traks = Vec::with_capacity(movie.tracks.len());
    for track in &movie.tracks {
        traks.push(write_trak(track)?);
    }
    let mut children: Vec<&[u8]> = vec![mvhd.as_slice()];
    children.extend(traks.iter().map(|t| t.as_slice()));
    write_container_box(b"moov", &children)
}

const IDENTITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

fn put_matrix(content: &mut Vec<u8>) {
    for v in IDENTITY_MATRIX {
        content.put_u32(v);
    }
}

fn write_mvhd(movie: &Movie) -> Result<Vec<u8>, SerializeError> {
    let mut content = Vec::with_capacity(108);
    content.put_u64(0); // creation_time
    content.put_u64(0); // modification_time
    content.put_u32(movie.timescale);
    content.put_u64(movie.duration);
    content.put_u32(0x0001_0000); // rate 1.0
    content.put_u16(0x0100); // volume 1.0
    content.put_bytes(0, 10);
    put_matrix(&mut content);
    content.put_bytes(0, 24);
    content.put_u32(movie.tracks.len() as u32 + 1); // next_track_ID
    write_full_box(b"mvhd", 1, 0, &content)
}

fn write_trak(track: &Track) -> Result<Vec<u8>, SerializeError> {
    let tkhd = write_tkhd(track)?;
    let edts = write_edts(&track.edit_list)?;
    let mdia = write_mdia(track)?;
    write_container_box(b"trak", &[&tkhd, &edts, &mdia])
}

/// Presentation length of a track in movie ticks, leading empty edits included
fn edit_duration(track: &Track) -> u64 {
    if track.edit_list.is_empty() {
        return track.movie_duration();
    }
    track.edit_list.iter().map(|e| e.segment_duration).sum()
}

fn write_tkhd(track: &Track) -> Result<Vec<u8>, SerializeError> {
    let mut content = Vec::with_capacity(88);
    content.put_u64(0);
    content.put_u64(0);
    content.put_u32(track.id);
    content.put_u32(0);
    content.put_u64(edit_duration(track));
    content.put_bytes(0, 8);
    content.put_u16(0); // layer
    content.put_u16(0); // alternate_group
    content.put_u16(if track.kind == TrackKind::Audio { 0x0100 } else { 0 });
    content.put_u16(0);
    put_matrix(&mut content);
    match &track.codec {
        CodecInfo::Avc { width, height } => {
            content.put_u32((*width as u32) << 16);
            content.put_u32((*height as u32) << 16);
        }
        CodecInfo::Aac { .. } => {
            content.put_u32(0);
            content.put_u32(0);
        }
    }
    // enabled | in_movie | in_preview
    write_full_box(b"tkhd", 1, 7, &content)
}

fn write_edts(edits: &[EditEntry]) -> Result<Vec<u8>, SerializeError> {
    let mut content = Vec::with_capacity(4 + edits.len() * 20);
    content.put_u32(edits.len() as u32);
    for edit in edits {
        content.put_u64(edit.segment_duration);
        content.put_i64(edit.media_time);
        content.put_u16(1); // media_rate_integer
        content.put_u16(0); // media_rate_fraction
    }
    let elst = write_full_box(b"elst", 1, 0, &content)?;
    write_container_box(b"edts", &[&elst])
}

fn write_mdia(track: &Track) -> Result<Vec<u8>, SerializeError> {
    let mdhd = write_mdhd(track.timescale, track.duration)?;
    let hdlr = match track.kind {
        TrackKind::Video => write_hdlr(b"vide", b"VideoHandler")?,
        TrackKind::Audio => write_hdlr(b"soun", b"SoundHandler")?,
    };
    let minf = write_minf(track)?;
    write_container_box(b"mdia", &[&mdhd, &hdlr, &minf])
}

fn write_mdhd(timescale: u32, duration: u64) -> Result<Vec<u8>, SerializeError> {
    let mut content = Vec::with_capacity(32);
    content.put_u64(0);
    content.put_u64(0);
    content.put_u32(timescale);
    content.put_u64(duration);
    content.put_u16(0x55C4); // language "und"
    content.put_u16(0);
    write_full_box(b"mdhd", 1, 0, &content)
}

fn write_hdlr(handler_type: &[u8; 4], name: &[u8]) -> Result<Vec<u8>, SerializeError> {
    let mut content = Vec::with_capacity(21 + name.len());
    content.put_u32(0); // pre_defined
    content.extend_from_slice(handler_type);
    content.put_bytes(0, 12);
    content.extend_from_slice(name);
    content.put_u8(0);
    write_full_box(b"hdlr", 0, 0, &content)
}

fn write_minf(track: &Track) -> Result<Vec<u8>, SerializeError> {
    let header = match track.kind {
        TrackKind::Video => write_full_box(b"vmhd", 0, 1, &[0u8; 8])?,
        TrackKind::Audio => write_full_box(b"smhd", 0, 0, &[0u8; 4])?,
    };
    let dinf = write_dinf()?;
    let stbl = write_stbl(track)?;
    write_container_box(b"minf", &[&header, &dinf, &stbl])
}

fn write_dinf() -> Result<Vec<u8>, SerializeError> {
    // self-contained data reference
    let url = write_full_box(b"url ", 0, 1, &[])?;
    let mut dref = Vec::with_capacity(4 + url.len());
    dref.put_u32(1);
    dref.extend_from_slice(&url);
    write_container_box(b"dinf", &[&write_full_box(b"dref", 0, 0, &dref)?])
}

fn write_stbl(track: &Track) -> Result<Vec<u8>, SerializeError> {
    let samples: Vec<Sample> = track.samples().copied().collect();
    if samples.len() > u32::MAX as usize {
        return Err(SerializeError::FieldOverflow(format!(
            "track {} has {} samples",
            track.id,
            samples.len()
        )));
    }

    let mut boxes = vec![write_stsd(track)?, write_stts(&samples)?];
    if !track.omit_composition_offsets && samples.iter().any(|s| s.composition_offset != 0) {
        boxes.push(write_ctts(&samples)?);
    }
    if track.kind == TrackKind::Video {
        boxes.push(write_stss(&samples)?);
    }
    boxes.push(write_stsc(track)?);
    boxes.push(write_stsz(&samples)?);
    boxes.push(write_chunk_offsets(track)?);

    let children: Vec<&[u8]> = boxes.iter().map(|b| b.as_slice()).collect();
    write_container_box(b"stbl", &children)
}

fn write_stsd(track: &Track) -> Result<Vec<u8>, SerializeError> {
    let entry = match &track.codec {
        CodecInfo::Avc { width, height } => {
            let avcc = write_avcc(&track.parameter_sets)?.ok_or_else(|| {
                SerializeError::UnsupportedCodec(format!(
                    "video track {} has no usable SPS/PPS",
                    track.id
                ))
            })?;
            write_avc1(*width, *height, &avcc)?
        }
        CodecInfo::Aac {
            sample_rate,
            channels,
            audio_specific_config,
        } => write_mp4a(track.id, *sample_rate, *channels, audio_specific_config)?,
    };
    let mut content = Vec::with_capacity(4 + entry.len());
    content.put_u32(1);
    content.extend_from_slice(&entry);
    write_full_box(b"stsd", 0, 0, &content)
}

fn write_avc1(width: u16, height: u16, avcc: &[u8]) -> Result<Vec<u8>, SerializeError> {
    let mut entry = Vec::with_capacity(78 + avcc.len());
    entry.put_bytes(0, 6);
    entry.put_u16(1); // data_reference_index
    entry.put_bytes(0, 16);
    entry.put_u16(width);
    entry.put_u16(height);
    entry.put_u32(0x0048_0000); // 72 dpi
    entry.put_u32(0x0048_0000);
    entry.put_u32(0);
    entry.put_u16(1); // frame_count
    entry.put_bytes(0, 32); // compressorname
    entry.put_u16(0x0018);
    entry.put_i16(-1);
    entry.extend_from_slice(avcc);
    write_box(b"avc1", &entry)
}

/// AVCDecoderConfigurationRecord with 4-byte NAL lengths.
/// `None` when the parameter sets cannot be described.
fn write_avcc(sets: &ParameterSets) -> Result<Option<Vec<u8>>, SerializeError> {
    let Some(sps) = sets.sps.first() else {
        return Ok(None);
    };
    if sps.len() < 4 || sets.pps.is_empty() || sets.sps.len() > 31 || sets.pps.len() > 255 {
        return Ok(None);
    }
    let mut content = Vec::new();
    content.put_u8(1);
    content.put_u8(sps[1]); // profile
    content.put_u8(sps[2]); // compatibility
    content.put_u8(sps[3]); // level
    content.put_u8(0xFF);
    content.put_u8(0xE0 | sets.sps.len() as u8);
    for s in &sets.sps {
        let Ok(len) = u16::try_from(s.len()) else {
            return Ok(None);
        };
        content.put_u16(len);
        content.extend_from_slice(s);
    }
    content.put_u8(sets.pps.len() as u8);
    for p in &sets.pps {
        let Ok(len) = u16::try_from(p.len()) else {
            return Ok(None);
        };
        content.put_u16(len);
        content.extend_from_slice(p);
    }
    write_box(b"avcC", &content).map(Some)
}

fn write_mp4a(
    es_id: u32,
    sample_rate: u32,
    channels: u16,
    asc: &[u8],
) -> Result<Vec<u8>, SerializeError> {
    let esds = write_esds(es_id as u16, asc)?;

    let mut entry = Vec::with_capacity(28 + esds.len());
    entry.put_bytes(0, 6);
    entry.put_u16(1);
    entry.put_bytes(0, 8);
    entry.put_u16(channels);
    entry.put_u16(16);
    entry.put_u32(0);
    // 16.16 fixed point; rates above 65535 do not fit and are left to the esds
    entry.put_u32(if sample_rate <= 0xFFFF { sample_rate << 16 } else { 0 });
    entry.extend_from_slice(&esds);
    write_box(b"mp4a", &entry)
}

fn write_esds(es_id: u16, asc: &[u8]) -> Result<Vec<u8>, SerializeError> {
    let mut dsi = vec![0x05];
    put_descr_length(&mut dsi, asc.len());
    dsi.extend_from_slice(asc);

    let mut dcd_body = Vec::with_capacity(13 + dsi.len());
    dcd_body.put_u8(0x40); // Audio ISO/IEC 14496-3
    dcd_body.put_u8(0x15); // AudioStream
    dcd_body.put_bytes(0, 3); // bufferSizeDB
    dcd_body.put_u32(0); // maxBitrate
    dcd_body.put_u32(0); // avgBitrate
    dcd_body.extend_from_slice(&dsi);
    let mut dcd = vec![0x04];
    put_descr_length(&mut dcd, dcd_body.len());
    dcd.extend_from_slice(&dcd_body);

    let sl = [0x06, 0x01, 0x02];

    let mut es_body = Vec::with_capacity(3 + dcd.len() + sl.len());
    es_body.put_u16(es_id);
    es_body.put_u8(0);
    es_body.extend_from_slice(&dcd);
    es_body.extend_from_slice(&sl);
    let mut es = vec![0x03];
    put_descr_length(&mut es, es_body.len());
    es.extend_from_slice(&es_body);

    write_full_box(b"esds", 0, 0, &es)
}

/// MPEG-4 descriptor length, expandable form (1-4 bytes)
fn put_descr_length(out: &mut Vec<u8>, len: usize) {
    let mut groups = Vec::with_capacity(4);
    let mut val = len;
    loop {
        groups.push((val & 0x7F) as u8);
        val >>= 7;
        if val == 0 || groups.len() == 4 {
            break;
        }
    }
    for (i, g) in groups.iter().rev().enumerate() {
        out.put_u8(if i + 1 < groups.len() { g | 0x80 } else { *g });
    }
}

fn run_length<T: PartialEq + Copy>(values: impl Iterator<Item = T>) -> Vec<(u32, T)> {
    let mut entries: Vec<(u32, T)> = Vec::new();
    for v in values {
        match entries.last_mut() {
            Some((count, last)) if *last == v => *count += 1,
            _ => entries.push((1, v)),
        }
    }
    entries
}

fn write_stts(samples: &[Sample]) -> Result<Vec<u8>, SerializeError> {
    let entries = run_length(samples.iter().map(|s| s.duration));
    let mut content = Vec::with_capacity(4 + entries.len() * 8);
    content.put_u32(entries.len() as u32);
    for (count, duration) in entries {
        content.put_u32(count);
        content.put_u32(duration);
    }
    write_full_box(b"stts", 0, 0, &content)
}

fn write_ctts(samples: &[Sample]) -> Result<Vec<u8>, SerializeError> {
    let entries = run_length(samples.iter().map(|s| s.composition_offset));
    let version = if entries.iter().any(|(_, o)| *o < 0) { 1 } else { 0 };
    let mut content = Vec::with_capacity(4 + entries.len() * 8);
    content.put_u32(entries.len() as u32);
    for (count, offset) in entries {
        content.put_u32(count);
        content.put_i32(offset);
    }
    write_full_box(b"ctts", version, 0, &content)
}

fn write_stss(samples: &[Sample]) -> Result<Vec<u8>, SerializeError> {
    let sync: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_sync)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let mut content = Vec::with_capacity(4 + sync.len() * 4);
    content.put_u32(sync.len() as u32);
    for n in sync {
        content.put_u32(n);
    }
    write_full_box(b"stss", 0, 0, &content)
}

/// One entry per run of chunks with the same sample count
fn write_stsc(track: &Track) -> Result<Vec<u8>, SerializeError> {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for (i, chunk) in track.chunks.iter().enumerate() {
        let count = chunk.samples.len() as u32;
        if entries.last().map(|(_, c)| *c) != Some(count) {
            entries.push((i as u32 + 1, count));
        }
    }
    let mut content = Vec::with_capacity(4 + entries.len() * 12);
    content.put_u32(entries.len() as u32);
    for (first_chunk, per_chunk) in entries {
        content.put_u32(first_chunk);
        content.put_u32(per_chunk);
        content.put_u32(1); // sample_description_index
    }
    write_full_box(b"stsc", 0, 0, &content)
}

fn write_stsz(samples: &[Sample]) -> Result<Vec<u8>, SerializeError> {
    let mut content = Vec::with_capacity(8 + samples.len() * 4);
    let uniform = samples.first().map(|s| s.size).filter(|size| {
        samples.iter().all(|s| s.size == *size)
    });
    match uniform {
        Some(size) => {
            content.put_u32(size);
            content.put_u32(samples.len() as u32);
        }
        None => {
            content.put_u32(0);
            content.put_u32(samples.len() as u32);
            for s in samples {
                content.put_u32(s.size);
            }
        }
    }
    write_full_box(b"stsz", 0, 0, &content)
}

fn write_chunk_offsets(track: &Track) -> Result<Vec<u8>, SerializeError> {
    let mut content = Vec::with_capacity(4 + track.chunks.len() * 8);
    content.put_u32(track.chunks.len() as u32);
    if track.wide_offsets {
        for chunk in &track.chunks {
            content.put_u64(chunk.offset);
        }
        return write_full_box(b"co64", 0, 0, &content);
    }
    for chunk in &track.chunks {
        let offset = u32::try_from(chunk.offset).map_err(|_| SerializeError::OffsetOverflow {
            track: track.id,
            offset: chunk.offset,
        })?;
        content.put_u32(offset);
    }
    write_full_box(b"stco", 0, 0, &content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isobmff::{find_box, ByteReader};
    use crate::store::BlobHandle;
    use crate::types::Chunk;

    fn video_track(wide: bool, offsets: &[u64], cto: i32) -> Track {
        let mut track = Track::new(
            1,
            CodecInfo::Avc {
                width: 640,
                height: 360,
            },
            90000,
        );
        track.parameter_sets = ParameterSets {
            sps: vec![Bytes::from_static(&[0x67, 0x64, 0x00, 0x1e, 0xac])],
            pps: vec![Bytes::from_static(&[0x68, 0xeb, 0xe3])],
        };
        track.wide_offsets = wide;
        for (i, off) in offsets.iter().enumerate() {
            track.chunks.push(Chunk {
                id: i as u32 + 1,
                samples: vec![
                    Sample {
                        duration: 3000,
                        composition_offset: cto,
                        is_sync: true,
                        size: 100,
                    },
                    Sample {
                        duration: 3000,
                        composition_offset: 0,
                        is_sync: false,
                        size: 50,
                    },
                ],
                relative_offset: *off,
                offset: *off,
                start_dts: i as i64 * 6000,
                end_dts: (i as i64 + 1) * 6000,
                start_pts: i as i64 * 6000,
                end_pts: (i as i64 + 1) * 6000,
                blob: BlobHandle::new(),
                stored_len: 158,
            });
        }
        track.duration = offsets.len() as u64 * 6000;
        track.edit_list = vec![EditEntry {
            segment_duration: track.duration,
            media_time: 0,
        }];
        track
    }

    fn movie(track: Track) -> Movie {
        Movie {
            timescale: 90000,
            duration: track.duration,
            tracks: vec![track],
        }
    }

    const STBL: [&[u8; 4]; 6] = [b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stco"];

    #[test]
    fn test_stco_entries() {
        let init = Mp4InitWriter.build_init_segment(&movie(video_track(false, &[8, 166], 0))).unwrap();
        let stco = find_box(&init, &STBL).unwrap();
        let mut r = ByteReader::new(stco, "stco");
        r.version_flags().unwrap();
        assert_eq!(r.u32().unwrap(), 2);
        assert_eq!(r.u32().unwrap(), 8);
        assert_eq!(r.u32().unwrap(), 166);
    }

    #[test]
    fn test_co64_when_wide() {
        let big = 5u64 << 32;
        let init = Mp4InitWriter.build_init_segment(&movie(video_track(true, &[8, big], 0))).unwrap();
        let mut path = STBL;
        path[5] = b"co64";
        let co64 = find_box(&init, &path).unwrap();
        let mut r = ByteReader::new(co64, "co64");
        r.version_flags().unwrap();
        assert_eq!(r.u32().unwrap(), 2);
        assert_eq!(r.u64().unwrap(), 8);
        assert_eq!(r.u64().unwrap(), big);
        assert!(find_box(&init, &STBL).is_none());
    }

    #[test]
    fn test_narrow_overflow() {
        let err = Mp4InitWriter
            .build_init_segment(&movie(video_track(false, &[1u64 << 32], 0)))
            .unwrap_err();
        assert_eq!(
            err,
            SerializeError::OffsetOverflow {
                track: 1,
                offset: 1 << 32
            }
        );
    }

    #[test]
    fn test_idempotent_output() {
        let m = movie(video_track(false, &[8, 166, 324], 3000));
        let a = Mp4InitWriter.build_init_segment(&m).unwrap();
        let b = Mp4InitWriter.build_init_segment(&m).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_ctts_written_only_when_needed() {
        let stbl_path: [&[u8; 4]; 6] = [b"moov", b"trak", b"mdia", b"minf", b"stbl", b"ctts"];
        let with = Mp4InitWriter.build_init_segment(&movie(video_track(false, &[8], 3000))).unwrap();
        assert!(find_box(&with, &stbl_path).is_some());

        let without = Mp4InitWriter.build_init_segment(&movie(video_track(false, &[8], 0))).unwrap();
        assert!(find_box(&without, &stbl_path).is_none());

        let mut flattened = video_track(false, &[8], 3000);
        flattened.omit_composition_offsets = true;
        let out = Mp4InitWriter.build_init_segment(&movie(flattened)).unwrap();
        assert!(find_box(&out, &stbl_path).is_none());
    }

    #[test]
    fn test_missing_parameter_sets_is_unsupported() {
        let mut track = video_track(false, &[8], 0);
        track.parameter_sets = ParameterSets::default();
        let err = Mp4InitWriter.build_init_segment(&movie(track)).unwrap_err();
        assert!(matches!(err, SerializeError::UnsupportedCodec(_)));
    }

    #[test]
    fn test_stsc_runs() {
        let mut track = video_track(false, &[8, 166, 324], 0);
        track.chunks[2].samples.pop();
        let init = Mp4InitWriter.build_init_segment(&movie(track)).unwrap();
        let mut path = STBL;
        path[5] = b"stsc";
        let stsc = find_box(&init, &path).unwrap();
        let mut r = ByteReader::new(stsc, "stsc");
        r.version_flags().unwrap();
        assert_eq!(r.u32().unwrap(), 2);
        assert_eq!((r.u32().unwrap(), r.u32().unwrap(), r.u32().unwrap()), (1, 2, 1));
        assert_eq!((r.u32().unwrap(), r.u32().unwrap(), r.u32().unwrap()), (3, 1, 1));
    }

    #[test]
    fn test_descr_length_forms() {
        let mut short = Vec::new();
        put_descr_length(&mut short, 5);
        assert_eq!(short, vec![5]);

        let mut long = Vec::new();
        put_descr_length(&mut long, 200);
        assert_eq!(long, vec![0x81, 0x48]);
    }
}
