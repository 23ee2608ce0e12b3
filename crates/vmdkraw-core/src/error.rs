//! Error types for the vmdkraw core library.

use std::path::PathBuf;

/// The main error type for decoding operations.
///
/// Every variant is fatal to the conversion job that produced it. Offsets are
/// byte offsets into the source extent unless the field name says otherwise.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The extent header does not start with `KDMV`.
    #[error("invalid VMDK magic: expected \"KDMV\", found {found:02X?}")]
    InvalidMagic { found: Vec<u8> },

    /// A fixed-layout record could not be decoded.
    #[error("malformed {record} at offset {offset}: {reason}")]
    MalformedRecord {
        record: &'static str,
        offset: u64,
        reason: String,
    },

    /// A record or payload extends past the end of the source.
    #[error("truncated stream: {needed} bytes needed at offset {offset}, source is {source_len} bytes")]
    TruncatedStream {
        offset: u64,
        needed: u64,
        source_len: u64,
    },

    /// A grain table entry points at something other than a grain marker.
    #[error("grain {grain} references offset {offset}, which holds {found} instead of a grain marker")]
    CorruptGrainReference {
        grain: u64,
        offset: u64,
        found: String,
    },

    /// A compressed grain payload could not be inflated.
    #[error("failed to decompress grain at offset {offset}: {message}")]
    Decompression { offset: u64, message: String },

    /// The walk ran out of input without seeing an end-of-stream marker.
    #[error("stream ended at offset {offset} without an end-of-stream marker")]
    IncompleteStream { offset: u64 },

    /// The output sink rejected a write.
    #[error("sink write failed at output position {position}: {source}")]
    SinkWrite {
        position: u64,
        source: std::io::Error,
    },

    /// The caller aborted the conversion.
    #[error("conversion cancelled")]
    Cancelled,

    /// A grain table maps to a virtual range that was already emitted.
    #[error("grain table at offset {offset} maps to table {table}, but output is already at table {expected}")]
    UnorderedGrainTable {
        offset: u64,
        table: u64,
        expected: u64,
    },

    /// A decompressed grain has the wrong length under the strict length policy.
    #[error("grain {grain} decompressed to {actual} bytes, expected {expected}")]
    GrainLength {
        grain: u64,
        expected: u64,
        actual: u64,
    },

    /// The disk descriptor names a format this decoder does not handle.
    #[error("unsupported disk format: {format}")]
    UnsupportedFormat { format: String },
}

/// A specialized Result type for vmdkraw operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error category, for callers that only branch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    InvalidMagic,
    MalformedRecord,
    TruncatedStream,
    CorruptGrainReference,
    Decompression,
    IncompleteStream,
    SinkWrite,
    Cancelled,
    UnorderedGrainTable,
    GrainLength,
    UnsupportedFormat,
}

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a malformed-record error.
    pub fn malformed(record: &'static str, offset: u64, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            record,
            offset,
            reason: reason.into(),
        }
    }

    /// Create a malformed-record error for a buffer shorter than its layout.
    pub fn short_record(record: &'static str, offset: u64, needed: usize, found: usize) -> Self {
        Self::malformed(
            record,
            offset,
            format!("needs {} bytes, found {}", needed, found),
        )
    }

    /// Create a truncated-stream error.
    pub fn truncated(offset: u64, needed: u64, source_len: u64) -> Self {
        Self::TruncatedStream {
            offset,
            needed,
            source_len,
        }
    }

    /// Create a decompression error.
    pub fn decompression(offset: u64, message: impl Into<String>) -> Self {
        Self::Decompression {
            offset,
            message: message.into(),
        }
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::InvalidMagic { .. } => ErrorKind::InvalidMagic,
            Self::MalformedRecord { .. } => ErrorKind::MalformedRecord,
            Self::TruncatedStream { .. } => ErrorKind::TruncatedStream,
            Self::CorruptGrainReference { .. } => ErrorKind::CorruptGrainReference,
            Self::Decompression { .. } => ErrorKind::Decompression,
            Self::IncompleteStream { .. } => ErrorKind::IncompleteStream,
            Self::SinkWrite { .. } => ErrorKind::SinkWrite,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::UnorderedGrainTable { .. } => ErrorKind::UnorderedGrainTable,
            Self::GrainLength { .. } => ErrorKind::GrainLength,
            Self::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
