//! Error types for the locksmith_core library.
//!
//! Card operations use a layered set of errors: [`FormatError`] for bad
//! logical input caught before any hardware access, [`AccessError`] for
//! violations against a [`CardImage`](crate::CardImage), [`TransportError`]
//! for reader failures, and [`OpError`] which aggregates them for the
//! provisioning engine. [`Error`] covers configuration and journal I/O and
//! is what binaries report.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for configuration, journal and file operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid key, access bits or setup values
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Card operation failed
    #[error(transparent)]
    Op(#[from] OpError),

    /// Reader could not be reached outside an operation
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Malformed or out-of-range logical values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("key must be exactly 6 bytes (12 hex digits), got {0} bytes")]
    KeyLength(usize),

    #[error("access bits must be 3 or 4 bytes (6 or 8 hex digits), got {0} bytes")]
    AccessLength(usize),

    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("access bits are corrupt: inverted copy does not match")]
    AccessParity,

    #[error("access condition {condition:03b} leaves the sector trailer permanently unwritable")]
    TrailerLockout { condition: u8 },

    #[error("{field} = {value} is out of range (max {max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },

    #[error("block {block} is not a valid payload block: {reason}")]
    PayloadBlock { block: u8, reason: &'static str },

    #[error("setup block {block} byte {offset} holds reserved value {value:#04x}")]
    Reserved { block: u8, offset: usize, value: u8 },

    #[error("setup block 60 does not carry the setup signature")]
    Signature,

    #[error("setup blocks fail checksum (expected {expected:#04x}, found {found:#04x})")]
    Checksum { expected: u8, found: u8 },

    #[error("setup blocks are half-written: block {blank} is blank but block {written} is not")]
    HalfWritten { blank: u8, written: u8 },
}

/// Permission or address violation against a card image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("block {0} is out of range")]
    OutOfRange(usize),

    #[error("block 0 is read-only manufacturer data")]
    ManufacturerBlock,

    #[error("sector {0} has not been authenticated")]
    NotAuthenticated(u8),

    #[error("block {0} has not been read")]
    Unloaded(u8),

    #[error("access bits of sector {sector} forbid writing block {block} with key {key_type}")]
    WriteForbidden {
        sector: u8,
        block: u8,
        key_type: crate::KeyType,
    },

    #[error("access bits of sector {sector} forbid reading block {block} with key {key_type}")]
    ReadForbidden {
        sector: u8,
        block: u8,
        key_type: crate::KeyType,
    },
}

/// Reader or card communication failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no readers available")]
    NoReaders,

    #[error("reader not found: {0}")]
    ReaderNotFound(String),

    #[error("no card present in reader {0}")]
    NoCard(String),

    #[error("authentication rejected for sector {0}")]
    AuthRejected(u8),

    #[error("card returned status {sw1:02X} {sw2:02X}")]
    Status { sw1: u8, sw2: u8 },

    #[error("card returned {0} bytes, expected 16")]
    ShortRead(usize),

    #[error("{0}")]
    Other(String),
}

/// Lock number sequencing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("lock number {current} is at the maximum {max} and wrapping is disabled")]
    Exhausted { current: u16, max: u16 },

    #[error("lock number range {min}..={max} is empty")]
    EmptyRange { min: u16, max: u16 },
}

/// Failure of a provisioning engine operation.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("{step}: {source}")]
    Transport {
        step: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error("sector {sector} could not be authenticated with any configured key")]
    Authentication { sector: u8 },

    #[error("card does not match the expected encoding: {0}")]
    EncodingMismatch(String),

    #[error("cancelled before {before_step}")]
    Cancelled { before_step: String },

    #[error("stopped at {failed_step} after {completed} completed step(s): {source}")]
    Partial {
        completed: usize,
        failed_step: String,
        #[source]
        source: Box<OpError>,
    },
}

impl OpError {
    /// Wrap a transport error with the step that produced it.
    pub fn transport(step: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            step: step.into(),
            source,
        }
    }

    /// Wrap an error raised after `completed` steps already took effect.
    ///
    /// With no completed steps the error is returned unchanged.
    pub fn partial(completed: usize, failed_step: impl Into<String>, source: OpError) -> Self {
        if completed == 0 {
            return source;
        }
        Self::Partial {
            completed,
            failed_step: failed_step.into(),
            source: Box::new(source),
        }
    }
}
