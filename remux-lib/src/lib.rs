pub(crate) mod assembler;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod isobmff;
pub(crate) mod progress;
pub(crate) mod serializer;
pub(crate) mod session;
pub(crate) mod source;
pub(crate) mod store;
pub(crate) mod strategy;
pub(crate) mod timeline;
pub(crate) mod transmux;
pub(crate) mod types;

#[cfg(test)]
pub(crate) mod tests;

pub use assembler::{AssembledTracks, IngestReport, TrackAssembler};
pub use config::{RemuxOptions, StoreConfig, StoreKind};
pub use error::{
    RecoverableReason, RemuxError, Result, SerializeError, StoreError, TransmuxError,
};
pub use progress::{DiagnosticEvent, DiagnosticSink, ProgressSink};
pub use serializer::{build_with_offsets, ContainerSerializer, Mp4InitWriter};
pub use session::{mime_type, ConversionSession, OutputArtifact};
pub use source::{DataProvider, FileProvider, FragmentRecord, FragmentSource, TaggedFragment};
pub use store::{
    create_store, BlobHandle, BlobStore, MemoryBlobStore, SpillBlobStore, StoreGuard,
};
pub use strategy::{Capabilities, FallbackRequest, ReencodeFallback, Remuxer};
pub use timeline::{reconcile, ALIGNMENT_EPSILON_SECS};
pub use transmux::{
    Fmp4Transmuxer, Fmp4TransmuxerFactory, TrackSegment, TransmuxOutput, Transmuxer,
    TransmuxerFactory,
};
pub use types::{
    rescale, Chunk, CodecInfo, EditEntry, Movie, ParameterSets, Sample, SequenceInfo, Track,
    TrackKind, MDAT_HEADER_LEN,
};

pub use tokio_util::sync::CancellationToken;
