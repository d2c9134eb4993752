use thiserror::Error;

/// Reasons a structural merge may fail that a full re-encode can still recover from.
///
/// Collaborators classify their own failures into this closed set; nothing
/// outside it ever triggers the re-encode fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoverableReason {
    /// The elementary stream uses a codec the merge path cannot carry
    UnsupportedCodec,
    /// A box is truncated or its fields are inconsistent
    MalformedBox,
    /// The payload is not the container family the merge path expects
    WrongContainer,
    /// A top-level structural box (`moov`, `moof`, `mdat`) is absent
    MissingStructuralBox,
    /// A fragment referenced parser state that was never established
    IncompleteParse,
}

impl std::fmt::Display for RecoverableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoverableReason::UnsupportedCodec => "unsupported codec",
            RecoverableReason::MalformedBox => "malformed box",
            RecoverableReason::WrongContainer => "wrong container",
            RecoverableReason::MissingStructuralBox => "missing structural box",
            RecoverableReason::IncompleteParse => "incomplete parse",
        };
        f.write_str(s)
    }
}

/// Main error type for a conversion
#[derive(Error, Debug)]
pub enum RemuxError {
    /// The bitstream transmuxer rejected a fragment
    #[error("Transmux error: {0}")]
    Transmux(#[from] TransmuxError),

    /// The container serializer could not build the init segment
    #[error("Serialization error: {0}")]
    Serialize(#[from] SerializeError),

    /// The spillover blob store failed
    #[error("Blob store error: {0}")]
    Store(#[from] StoreError),

    /// A standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A track, or a track's chunks, are absent at finalize time
    #[error("Missing track data: {0}")]
    MissingTrackData(String),

    /// The fragment input could not be normalized
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A chunk payload does not fit a 32-bit `mdat` box
    #[error("Chunk too large: {0} bytes")]
    ChunkTooLarge(u64),

    /// The re-encode fallback failed
    #[error("Fallback conversion failed: {0}")]
    Fallback(String),

    /// The conversion was cancelled by the caller
    #[error("Conversion cancelled")]
    Cancelled,
}

impl RemuxError {
    /// The recoverable classification of this failure, if any.
    pub fn recoverable_reason(&self) -> Option<RecoverableReason> {
        match self {
            RemuxError::Transmux(e) => e.recoverable_reason(),
            RemuxError::Serialize(e) => e.recoverable_reason(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RemuxError::Cancelled)
    }
}

/// Errors reported by a [`Transmuxer`](crate::transmux::Transmuxer)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransmuxError {
    /// The stream's sample entry is not one the merge path supports
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// A box is truncated or internally inconsistent
    #[error("Malformed box: {0}")]
    MalformedBox(String),

    /// The payload is not an ISO BMFF / expected container
    #[error("Wrong container type: {0}")]
    WrongContainer(String),

    /// A required top-level box is missing
    #[error("Missing box: {0}")]
    MissingBox(String),

    /// The fragment refers to a track or init state that was never parsed
    #[error("Incomplete parser state: {0}")]
    IncompleteState(String),

    /// Any other parse failure
    #[error("Parse error: {0}")]
    Parse(String),
}

impl TransmuxError {
    pub fn recoverable_reason(&self) -> Option<RecoverableReason> {
        match self {
            TransmuxError::UnsupportedCodec(_) => Some(RecoverableReason::UnsupportedCodec),
            TransmuxError::MalformedBox(_) => Some(RecoverableReason::MalformedBox),
            TransmuxError::WrongContainer(_) => Some(RecoverableReason::WrongContainer),
            TransmuxError::MissingBox(_) => Some(RecoverableReason::MissingStructuralBox),
            TransmuxError::IncompleteState(_) => Some(RecoverableReason::IncompleteParse),
            TransmuxError::Parse(_) => None,
        }
    }
}

/// Errors reported by a [`ContainerSerializer`](crate::serializer::ContainerSerializer)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    /// A chunk offset does not fit a 32-bit `stco` entry
    #[error("Chunk offset overflow on track {track}: offset={offset}")]
    OffsetOverflow { track: u32, offset: u64 },

    /// A 32-bit size or count field would overflow
    #[error("Field overflow: {0}")]
    FieldOverflow(String),

    /// The track's codec cannot be described in a sample entry
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// The two serialization passes disagreed on the init segment length
    #[error("Init segment length changed between passes: {first} != {second}")]
    UnstableLayout { first: usize, second: usize },
}

impl SerializeError {
    pub fn recoverable_reason(&self) -> Option<RecoverableReason> {
        match self {
            SerializeError::UnsupportedCodec(_) => Some(RecoverableReason::UnsupportedCodec),
            _ => None,
        }
    }

    /// Whether the wide-offset retry can fix this failure
    pub fn is_overflow(&self) -> bool {
        matches!(
            self,
            SerializeError::OffsetOverflow { .. } | SerializeError::FieldOverflow(_)
        )
    }
}

/// Spillover blob store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store was closed; all handles are invalid
    #[error("Blob store is closed")]
    Closed,

    /// The handle does not name a stored blob
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// Backing storage failed
    #[error("Blob store IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RemuxError>;
