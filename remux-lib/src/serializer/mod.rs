//! Container serialization
//!
//! The init segment carries absolute chunk offsets, but those offsets depend
//! on the init segment's own length. [`build_with_offsets`] resolves this with
//! two passes: measure with provisional offsets, shift every chunk past the
//! measured length, then serialize again.

pub mod mp4;

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::SerializeError;
use crate::progress::{emit, DiagnosticEvent, DiagnosticSink};
use crate::types::Movie;

pub use mp4::Mp4InitWriter;

/// Builds the structural metadata (`ftyp` + `moov`) for a reconciled movie.
///
/// Implementations must be pure functions of the movie: the same input yields
/// byte-identical output.
pub trait ContainerSerializer: Send + Sync {
    fn build_init_segment(&self, movie: &Movie) -> Result<Bytes, SerializeError>;
}

/// Serialize `movie` with final chunk offsets.
///
/// An offset overflow in 32-bit mode switches every track to 64-bit offsets
/// and repeats the procedure once. On return, every chunk's `offset` equals its
/// `relative_offset` plus the length of the returned init segment.
pub fn build_with_offsets(
    serializer: &dyn ContainerSerializer,
    movie: &mut Movie,
    diagnostics: Option<&DiagnosticSink>,
) -> Result<Bytes, SerializeError> {
    let already_wide = movie.tracks.iter().all(|t| t.wide_offsets);
    match two_pass(serializer, movie) {
        Err(e) if e.is_overflow() && !already_wide => {
            let max_offset = match &e {
                SerializeError::OffsetOverflow { offset, .. } => *offset,
                _ => max_offset(movie),
            };
            info!(
                "Chunk offsets exceed 32 bits ({}), switching to co64",
                max_offset
            );
            emit(diagnostics, DiagnosticEvent::WideOffsetRetry { max_offset });
            movie.reset_offsets();
            movie.set_wide_offsets(true);
            two_pass(serializer, movie)
        }
        other => other,
    }
}

fn two_pass(
    serializer: &dyn ContainerSerializer,
    movie: &mut Movie,
) -> Result<Bytes, SerializeError> {
    movie.reset_offsets();
    let first = serializer.build_init_segment(movie)?;

    movie.apply_offset_base(first.len() as u64);
    let second = serializer.build_init_segment(movie)?;

    if first.len() != second.len() {
        return Err(SerializeError::UnstableLayout {
            first: first.len(),
            second: second.len(),
        });
    }
    debug!("Init segment is {} bytes", second.len());
    Ok(second)
}

fn max_offset(movie: &Movie) -> u64 {
    movie
        .tracks
        .iter()
        .flat_map(|t| t.chunks.iter())
        .map(|c| c.offset)
        .max()
        .unwrap_or(0)
}
