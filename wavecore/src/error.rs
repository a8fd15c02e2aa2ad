use std::fmt;

use thiserror::Error;

/// Errors produced while decoding trace files.
///
/// Most of these are isolated: the parser records them as a [`Diagnostic`]
/// against the block or line they occurred in and carries on with the rest
/// of the file. Only failures to open the file or to read its fixed header
/// abort a load, and those are reported through `anyhow`.
#[derive(Debug, Error)]
pub enum WaveError {
    #[error("malformed varint at offset {offset}")]
    MalformedVarint { offset: usize },

    #[error("unterminated string at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("unrecognized block type {block_type}")]
    UnrecognizedBlockType { block_type: u8 },

    #[error("unrecognized hierarchy tag {tag} at offset {offset}")]
    UnrecognizedTag { tag: u8, offset: usize },

    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("truncated file: needed {needed} bytes at offset {offset} but only {available} remain")]
    TruncatedFile {
        offset: u64,
        needed: u64,
        available: u64,
    },

    #[error("byte offset mismatch: expected {expected}, actually at {actual}")]
    InconsistentByteOffset { expected: u64, actual: u64 },

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("io error")]
    Io(#[from] std::io::Error),
}

pub type WaveResult<T> = std::result::Result<T, WaveError>;

/// Where in the input an isolated error happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// An FST block, identified by its byte offset in the file.
    Block { offset: u64 },
    /// A VCD line, identified by the byte offset of its first character.
    Line { offset: u64 },
    /// A signal, while assembling its transitions.
    Signal { id: String },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Block { offset } => write!(f, "block at offset {offset}"),
            Location::Line { offset } => write!(f, "line at offset {offset}"),
            Location::Signal { id } => write!(f, "signal {id}"),
        }
    }
}

/// A non-fatal error that was isolated to part of the file.
#[derive(Debug)]
pub struct Diagnostic {
    pub location: Location,
    pub error: WaveError,
}

impl Diagnostic {
    pub fn new(location: Location, error: WaveError) -> Self {
        log::warn!("{location}: {error}");
        Self { location, error }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.error)
    }
}

/// Check an internal cursor against the real stream position. A mismatch is
/// a parser bug so it panics in debug builds.
pub fn check_offset(expected: u64, actual: u64) -> WaveResult<()> {
    debug_assert_eq!(expected, actual, "parser cursor diverged from stream");
    if expected != actual {
        return Err(WaveError::InconsistentByteOffset { expected, actual });
    }
    Ok(())
}
