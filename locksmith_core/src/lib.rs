#![forbid(unsafe_code)]

//! Core domain model and card logic for Locksmith, a provisioning tool for
//! MIFARE Classic based lock systems.
//!
//! This crate provides:
//! - Card types (keys, access bits, card image)
//! - Setup block encoding and lock number sequencing
//! - Provisioning engine over a pluggable card transport
//! - Persistence (config, audit journal)

pub mod types;
pub mod error;
pub mod access;
pub mod image;
pub mod setup;
pub mod sequence;
pub mod transport;
pub mod engine;
pub mod config;
pub mod envelope;
pub mod journal;
pub mod logging;

// Re-export commonly used types
pub use error::{AccessError, Error, FormatError, OpError, Result, SequenceError, TransportError};
pub use types::*;
pub use access::{AccessBits, AccessCondition};
pub use image::{CardImage, SectorAuth};
pub use setup::{SetupBlockCodec, SetupRecord, SetupState};
pub use sequence::{LockNumberSequencer, Overflow};
pub use transport::{CardTransport, Session, SimulatedCard, TransportHandle};
pub use engine::{
    CancelToken, CardPayload, CheckOutcome, ClearReport, DecodedPayload, DumpReport,
    EncodeReport, EngineSettings, ProvisioningEngine, RestoreReport, SetupWriteOutcome,
};
pub use config::{Config, ConfigStore, FileConfigStore, Settings};
pub use envelope::Envelope;
pub use journal::{EventSink, JournalSink, Outcome, ProvisioningEvent};

#[cfg(feature = "pcsc")]
pub use transport::PcscTransport;
