//! Timeline reconciliation
//!
//! Tracks from independent fragment streams rarely start at the same decode
//! time. The reconciler picks the earliest start as the shared origin, delays
//! later tracks with a leading empty edit, and settles every duration in the
//! movie timescale.

use tracing::{debug, warn};

use crate::config::RemuxOptions;
use crate::error::{RemuxError, Result};
use crate::progress::{emit, DiagnosticEvent, DiagnosticSink};
use crate::types::{rescale, EditEntry, Movie, Track, TrackKind};

/// Start gaps at or below this many seconds are treated as aligned
pub const ALIGNMENT_EPSILON_SECS: f64 = 0.01;

/// Check that every expected track carries data and build the movie timeline.
pub fn reconcile(
    mut tracks: Vec<Track>,
    expected: &[TrackKind],
    options: &RemuxOptions,
    diagnostics: Option<&DiagnosticSink>,
) -> Result<Movie> {
    if tracks.is_empty() {
        return Err(RemuxError::MissingTrackData(
            "no track produced any samples".to_string(),
        ));
    }
    for kind in expected {
        if !tracks.iter().any(|t| t.kind == *kind) {
            return Err(RemuxError::MissingTrackData(format!(
                "{} fragments produced no {} track",
                kind, kind
            )));
        }
    }
    if let Some(empty) = tracks.iter().find(|t| t.chunks.is_empty()) {
        return Err(RemuxError::MissingTrackData(format!(
            "{} track {} has no chunks",
            empty.kind, empty.id
        )));
    }

    let start_secs = |t: &Track| -> f64 {
        t.first_chunk()
            .map_or(0.0, |c| c.start_dts as f64 / t.timescale as f64)
    };
    let min_dts = tracks
        .iter()
        .map(start_secs)
        .fold(f64::INFINITY, f64::min);
    let movie_timescale = tracks[0].timescale;

    let mut flatten_warned = false;
    for track in &mut tracks {
        let (Some(first), Some(last)) = (track.first_chunk(), track.last_chunk()) else {
            continue;
        };
        let (first_dts, first_pts, last_end) = (first.start_dts, first.start_pts, last.end_dts);
        let timescale = track.timescale;
        let origin = (min_dts * timescale as f64).round() as i64;

        track.movie_timescale = movie_timescale;
        track.edit_list.clear();
        track.padding = 0;

        let gap = first_dts as f64 / timescale as f64 - min_dts;
        if gap > ALIGNMENT_EPSILON_SECS {
            track.padding = (first_dts - origin).max(0);
            let empty = rescale(track.padding as u64, timescale, movie_timescale);
            debug!(
                "{} track {} starts {:.3}s late, empty edit of {} ticks",
                track.kind, track.id, gap, empty
            );
            track.edit_list.push(EditEntry::empty(empty));
        }

        let media_start = (first_pts - first_dts).max(0);
        // Media actually covered; a late start is already in the padding
        let span = (last_end - first_dts).max(0);
        track.duration = span as u64;
        track.edit_list.push(EditEntry {
            segment_duration: rescale((span - media_start).max(0) as u64, timescale, movie_timescale),
            media_time: media_start,
        });

        track.omit_composition_offsets = false;
        if options.flatten_composition_offsets && track.kind == TrackKind::Video {
            if track.has_composition_offsets() {
                if !flatten_warned {
                    warn!(
                        "Track {} has non-zero composition offsets, keeping ctts",
                        track.id
                    );
                    flatten_warned = true;
                }
                emit(
                    diagnostics,
                    DiagnosticEvent::FlattenSkipped { track_id: track.id },
                );
            } else {
                track.omit_composition_offsets = true;
            }
        }
    }

    let duration = tracks.iter().map(Track::movie_duration).max().unwrap_or(0);
    Ok(Movie {
        timescale: movie_timescale,
        duration,
        tracks,
    })
}
