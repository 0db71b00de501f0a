//! Provisioning engine.
//!
//! One method per user action. Every operation:
//! 1. Validates its input (no card access on bad input)
//! 2. Locks the reader handle for its whole duration
//! 3. Authenticates each sector, trying keys in a fixed order
//! 4. Checks every write against a fresh `CardImage` before sending it
//!
//! Nothing is rolled back on failure. Multi-block operations report how far
//! they got, and re-running them is safe.

use crate::transport::{CardTransport, Session, TransportHandle};
use crate::{
    first_block, is_setup_block, is_trailer, sector_of, trailer_of, AccessBits, AccessError,
    Block, CardImage, FormatError, Key, KeyMaterial, KeyType, LockNumberSequencer, OpError,
    SetupBlockCodec, SetupRecord, SetupState, TransportError, BLOCKS_PER_SECTOR,
    MANUFACTURER_BLOCK, SECTOR_COUNT, SETUP_CONFIG_BLOCK, SETUP_SIGNATURE_BLOCK, ZERO_BLOCK,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// User data blocks the lock system reads
pub const PAYLOAD_BLOCKS: [u8; 2] = [33, 62];

/// Setup blocks in write order
const SETUP_BLOCKS: [u8; 2] = [SETUP_CONFIG_BLOCK, SETUP_SIGNATURE_BLOCK];

/// Where a candidate key comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeySource {
    Factory,
    Configured,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    key_type: KeyType,
    key: Key,
    source: KeySource,
}

/// Phases of one operation, logged as it runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Authenticating,
    ReadingOrWriting,
    Completed,
    Failed,
}

/// Shared flag for cancelling an operation between write steps
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deployment parameters the engine provisions with
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub keys: KeyMaterial,
    pub access_bits: AccessBits,
    /// User data block (33 or 62); its sector is the payload sector
    pub payload_block: u8,
    pub sequencer: LockNumberSequencer,
    /// Wrap to the start of the range instead of applying the overflow policy
    pub wrap_lock_numbers: bool,
    pub codec: SetupBlockCodec,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            keys: KeyMaterial::FACTORY,
            access_bits: AccessBits::TRANSPORT,
            payload_block: 62,
            sequencer: LockNumberSequencer::default(),
            wrap_lock_numbers: true,
            codec: SetupBlockCodec::default(),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), OpError> {
        if !PAYLOAD_BLOCKS.contains(&self.payload_block) {
            return Err(FormatError::PayloadBlock {
                block: self.payload_block,
                reason: "payload block must be 33 or 62",
            }
            .into());
        }
        self.access_bits.validate()?;
        self.sequencer.validate()?;
        Ok(())
    }

    pub const fn payload_sector(&self) -> u8 {
        sector_of(self.payload_block)
    }
}

/// Data blocks to write into the payload sector
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CardPayload {
    pub blocks: Vec<(u8, Block)>,
}

impl CardPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block(mut self, block: u8, data: Block) -> Self {
        self.blocks.push((block, data));
        self
    }

    /// Every block must be a plain data block of `sector`
    pub fn validate(&self, sector: u8) -> Result<(), FormatError> {
        let mut seen = Vec::with_capacity(self.blocks.len());
        for &(block, _) in &self.blocks {
            let reason = if block == MANUFACTURER_BLOCK {
                Some("manufacturer block is read-only")
            } else if sector_of(block) != sector {
                Some("outside the payload sector")
            } else if is_trailer(block) {
                Some("trailers are written from the configured keys")
            } else if is_setup_block(block) {
                Some("reserved for setup data")
            } else if seen.contains(&block) {
                Some("listed twice")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(FormatError::PayloadBlock { block, reason });
            }
            seen.push(block);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DumpReport {
    pub text: String,
    pub unreadable_sectors: Vec<u8>,
    pub image: CardImage,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub cleared: Vec<u8>,
    /// Blocks whose access bits forbid the write, with the reason
    pub skipped: Vec<(u8, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EncodeReport {
    pub sector: u8,
    pub blocks_written: Vec<u8>,
    /// Whether the new key A authenticated after the trailer write
    pub key_verified: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DecodedPayload {
    pub sector: u8,
    pub blocks: Vec<(u8, Block)>,
    pub access_bits: AccessBits,
    /// Lock that last closed with this card, if the lock recorded one
    pub last_lock: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub sector: u8,
    pub key_verified: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SetupWriteOutcome {
    pub record: SetupRecord,
    /// Lock number for the next card when auto-increment was requested
    pub new_lock_no: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Match { lock_number: u16 },
    Mismatch { expected: u16, found: u16 },
    Unprovisioned,
}

/// Orchestrates card operations for one deployment
#[derive(Clone, Debug, Default)]
pub struct ProvisioningEngine {
    settings: EngineSettings,
    cancel: Option<CancelToken>,
}

impl ProvisioningEngine {
    pub fn new(settings: EngineSettings) -> Result<Self, OpError> {
        settings.validate()?;
        Ok(Self {
            settings,
            cancel: None,
        })
    }

    /// Attach a token checked before every write step
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn candidates(&self, order: &[(KeyType, KeySource)]) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = Vec::with_capacity(order.len());
        for &(key_type, source) in order {
            let key = match source {
                KeySource::Factory => Key::FACTORY,
                KeySource::Configured => *self.settings.keys.key(key_type),
            };
            if !out.iter().any(|c| c.key_type == key_type && c.key == key) {
                out.push(Candidate {
                    key_type,
                    key,
                    source,
                });
            }
        }
        out
    }

    fn run<R>(&self, op: &str, f: impl FnOnce() -> Result<R, OpError>) -> Result<R, OpError> {
        let _span = tracing::info_span!("operation", op).entered();
        tracing::info!("{}: starting", op);
        let result = f();
        match &result {
            Ok(_) => tracing::info!(phase = ?Phase::Completed, "{}: completed", op),
            Err(e) => tracing::warn!(phase = ?Phase::Failed, "{}: failed: {}", op, e),
        }
        result
    }

    fn authenticate<T: CardTransport>(
        &self,
        session: &mut Session<'_, T>,
        image: &mut CardImage,
        sector: u8,
        candidates: &[Candidate],
    ) -> Result<Candidate, OpError> {
        tracing::debug!(phase = ?Phase::Authenticating, "Authenticating sector {}", sector);
        for candidate in candidates {
            match session.authenticate(sector, &candidate.key, candidate.key_type) {
                Ok(()) => {
                    tracing::debug!(
                        "Sector {} authenticated with key {} ({:?})",
                        sector,
                        candidate.key_type,
                        candidate.source
                    );
                    image.mark_authenticated(sector, candidate.key_type);
                    return Ok(*candidate);
                }
                Err(TransportError::AuthRejected(_)) | Err(TransportError::Status { .. }) => {
                    tracing::debug!(
                        "Sector {} rejected key {} ({:?})",
                        sector,
                        candidate.key_type,
                        candidate.source
                    );
                }
                Err(e) => {
                    return Err(OpError::transport(format!("authenticate sector {}", sector), e))
                }
            }
        }
        Err(OpError::Authentication { sector })
    }

    /// Read the trailer so writes are checked against the card's real policy
    fn learn_access<T: CardTransport>(
        &self,
        session: &mut Session<'_, T>,
        image: &mut CardImage,
        sector: u8,
    ) {
        let trailer = trailer_of(sector);
        match session.read_block(trailer) {
            Ok(data) => {
                let _ = image.load_block(trailer, data);
            }
            Err(e) => tracing::debug!("Could not read trailer {}: {}", trailer, e),
        }
    }

    /// Switch the session to key B when the sector's access bits deny the
    /// current key for any of `blocks` but allow key B. If no key B opens the
    /// sector, the previous key is restored and the caller's own permission
    /// checks report the denial.
    fn ensure_access<T: CardTransport>(
        &self,
        session: &mut Session<'_, T>,
        image: &mut CardImage,
        sector: u8,
        current: Candidate,
        blocks: &[u8],
        write: bool,
    ) -> Result<Candidate, OpError> {
        let Some(access) = image.access_bits(sector) else {
            return Ok(current);
        };
        let allowed = |key_type: KeyType| {
            blocks.iter().all(|&block| {
                let offset = block % BLOCKS_PER_SECTOR;
                if write {
                    access.can_write(offset, key_type)
                } else {
                    access.can_read(offset, key_type)
                }
            })
        };
        if current.key_type == KeyType::B || allowed(current.key_type) || !allowed(KeyType::B) {
            return Ok(current);
        }

        tracing::debug!("Sector {} needs key B for blocks {:?}", sector, blocks);
        let key_b = self.candidates(&[
            (KeyType::B, KeySource::Configured),
            (KeyType::B, KeySource::Factory),
        ]);
        match self.authenticate(session, image, sector, &key_b) {
            Ok(used) => Ok(used),
            Err(OpError::Authentication { .. }) => {
                tracing::warn!("Sector {} rejected every key B", sector);
                self.authenticate(session, image, sector, &[current])
            }
            Err(e) => Err(e),
        }
    }

    fn write<T: CardTransport>(
        &self,
        session: &mut Session<'_, T>,
        image: &mut CardImage,
        block: u8,
        data: &Block,
    ) -> Result<(), OpError> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(OpError::Cancelled {
                before_step: format!("write block {}", block),
            });
        }

        image.check_write(block as usize)?;
        tracing::debug!(phase = ?Phase::ReadingOrWriting, "Writing block {}", block);
        session
            .write_block(block, data)
            .map_err(|e| OpError::transport(format!("write block {}", block), e))?;
        image.load_block(block, *data)?;
        Ok(())
    }

    fn read<T: CardTransport>(
        &self,
        session: &mut Session<'_, T>,
        image: &mut CardImage,
        block: u8,
    ) -> Result<Block, OpError> {
        tracing::debug!(phase = ?Phase::ReadingOrWriting, "Reading block {}", block);
        let data = session
            .read_block(block)
            .map_err(|e| OpError::transport(format!("read block {}", block), e))?;
        image.load_block(block, data)?;
        Ok(image.read_block(block as usize)?)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Read every sector. Sectors that reject all keys are reported as
    /// unreadable instead of failing the dump.
    pub fn dump<T: CardTransport>(
        &self,
        handle: &TransportHandle<T>,
    ) -> Result<DumpReport, OpError> {
        self.run("dump", || {
            let mut session = handle.session();
            let mut image = CardImage::new();
            let candidates = self.candidates(&[
                (KeyType::A, KeySource::Factory),
                (KeyType::A, KeySource::Configured),
                (KeyType::B, KeySource::Factory),
                (KeyType::B, KeySource::Configured),
            ]);

            for sector in 0..SECTOR_COUNT {
                let used = match self.authenticate(&mut session, &mut image, sector, &candidates) {
                    Ok(used) => used,
                    Err(OpError::Authentication { .. }) => {
                        tracing::warn!("Sector {} could not be authenticated", sector);
                        image.mark_failed(sector, "authentication failed");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                self.learn_access(&mut session, &mut image, sector);

                let first = first_block(sector);
                let data: Vec<u8> = (first..trailer_of(sector)).collect();
                self.ensure_access(&mut session, &mut image, sector, used, &data, false)?;

                for block in first..first + BLOCKS_PER_SECTOR {
                    match session.read_block(block) {
                        Ok(data) => image.load_block(block, data)?,
                        Err(e) => image.mark_unreadable(block, format!("read failed: {}", e)),
                    }
                }
            }

            Ok(DumpReport {
                text: image.dump_text(),
                unreadable_sectors: image.failed_sectors(),
                image,
            })
        })
    }

    /// Zero every data block except the manufacturer block. Trailers are reset
    /// to factory keys and transport access bits only when requested.
    pub fn clear_all_blocks<T: CardTransport>(
        &self,
        handle: &TransportHandle<T>,
        include_trailers: bool,
    ) -> Result<ClearReport, OpError> {
        self.run("clear all blocks", || {
            let mut session = handle.session();
            let mut image = CardImage::new();
            let mut report = ClearReport::default();
            let candidates = self.candidates(&[
                (KeyType::A, KeySource::Factory),
                (KeyType::A, KeySource::Configured),
            ]);
            let factory_trailer = KeyMaterial::FACTORY.trailer(&AccessBits::TRANSPORT);

            for sector in 0..SECTOR_COUNT {
                let step = format!("sector {}", sector);
                let used = self
                    .authenticate(&mut session, &mut image, sector, &candidates)
                    .map_err(|e| OpError::partial(report.cleared.len(), step.as_str(), e))?;
                self.learn_access(&mut session, &mut image, sector);

                let first = first_block(sector);
                let targets: Vec<u8> = (first..first + BLOCKS_PER_SECTOR)
                    .filter(|&b| b != MANUFACTURER_BLOCK && (include_trailers || !is_trailer(b)))
                    .collect();
                self.ensure_access(&mut session, &mut image, sector, used, &targets, true)
                    .map_err(|e| OpError::partial(report.cleared.len(), step.as_str(), e))?;

                for block in first..first + BLOCKS_PER_SECTOR {
                    let data = if is_trailer(block) {
                        if !include_trailers {
                            continue;
                        }
                        factory_trailer
                    } else if block == MANUFACTURER_BLOCK {
                        continue;
                    } else {
                        ZERO_BLOCK
                    };

                    match self.write(&mut session, &mut image, block, &data) {
                        Ok(()) => report.cleared.push(block),
                        Err(OpError::Access(e @ AccessError::WriteForbidden { .. })) => {
                            tracing::warn!("Skipping block {}: {}", block, e);
                            report.skipped.push((block, e.to_string()));
                        }
                        Err(e) => {
                            return Err(OpError::partial(
                                report.cleared.len(),
                                format!("block {}", block),
                                e,
                            ))
                        }
                    }
                }
            }

            tracing::info!(
                "Cleared {} blocks, skipped {}",
                report.cleared.len(),
                report.skipped.len()
            );
            Ok(report)
        })
    }

    /// Write payload blocks, then the trailer carrying the configured keys
    /// and access bits. The trailer goes last so a failed data write never
    /// leaves the sector behind an unknown key.
    pub fn encode<T: CardTransport>(
        &self,
        handle: &TransportHandle<T>,
        payload: &CardPayload,
    ) -> Result<EncodeReport, OpError> {
        let sector = self.settings.payload_sector();
        payload.validate(sector)?;
        self.settings.access_bits.validate()?;

        self.run("encode", || {
            let mut session = handle.session();
            let mut image = CardImage::new();
            let candidates = self.candidates(&[
                (KeyType::A, KeySource::Factory),
                (KeyType::A, KeySource::Configured),
            ]);

            let used = self.authenticate(&mut session, &mut image, sector, &candidates)?;
            self.learn_access(&mut session, &mut image, sector);

            let mut targets: Vec<u8> = payload.blocks.iter().map(|(b, _)| *b).collect();
            targets.push(trailer_of(sector));
            self.ensure_access(&mut session, &mut image, sector, used, &targets, true)?;

            let mut written = Vec::with_capacity(payload.blocks.len() + 1);
            for (block, data) in &payload.blocks {
                self.write(&mut session, &mut image, *block, data)
                    .map_err(|e| OpError::partial(written.len(), format!("block {}", block), e))?;
                written.push(*block);
            }

            let trailer = trailer_of(sector);
            let data = self.settings.keys.trailer(&self.settings.access_bits);
            self.write(&mut session, &mut image, trailer, &data)
                .map_err(|e| OpError::partial(written.len(), format!("trailer {}", trailer), e))?;
            written.push(trailer);

            let key_verified = session
                .authenticate(sector, &self.settings.keys.key_a, KeyType::A)
                .is_ok();
            if !key_verified {
                tracing::warn!("New key A does not authenticate sector {}", sector);
            }

            Ok(EncodeReport {
                sector,
                blocks_written: written,
                key_verified,
            })
        })
    }

    /// Read the payload sector back and check it carries this deployment's
    /// keys and access bits
    pub fn decode<T: CardTransport>(
        &self,
        handle: &TransportHandle<T>,
    ) -> Result<DecodedPayload, OpError> {
        let sector = self.settings.payload_sector();

        self.run("decode", || {
            let mut session = handle.session();
            let mut image = CardImage::new();
            let candidates = self.candidates(&[
                (KeyType::A, KeySource::Configured),
                (KeyType::A, KeySource::Factory),
            ]);

            let used = self.authenticate(&mut session, &mut image, sector, &candidates)?;
            if used.source == KeySource::Factory && !self.settings.keys.key_a.is_factory() {
                return Err(OpError::EncodingMismatch(format!(
                    "sector {} still opens with the factory key",
                    sector
                )));
            }

            let trailer = self.read(&mut session, &mut image, trailer_of(sector))?;
            let access_bits = AccessBits::decode(&trailer[6..10]).map_err(|e| {
                OpError::EncodingMismatch(format!("trailer access bits unreadable: {}", e))
            })?;
            if access_bits != self.settings.access_bits {
                return Err(OpError::EncodingMismatch(format!(
                    "access bits {} differ from configured {}",
                    access_bits.to_hex(),
                    self.settings.access_bits.to_hex()
                )));
            }

            let first = first_block(sector);
            let data: Vec<u8> = (first..trailer_of(sector))
                .filter(|&b| b != MANUFACTURER_BLOCK && !is_setup_block(b))
                .collect();
            self.ensure_access(&mut session, &mut image, sector, used, &data, false)?;

            let mut blocks = Vec::with_capacity(data.len());
            for block in data {
                blocks.push((block, self.read(&mut session, &mut image, block)?));
            }

            let last_lock = blocks
                .iter()
                .find(|(b, _)| *b == self.settings.payload_block)
                .map(|(_, data)| data[4])
                .filter(|&lock| lock != 0);

            Ok(DecodedPayload {
                sector,
                blocks,
                access_bits,
                last_lock,
            })
        })
    }

    /// Put factory keys back on the payload sector, keeping the configured
    /// access bits
    pub fn restore_factory_keys<T: CardTransport>(
        &self,
        handle: &TransportHandle<T>,
    ) -> Result<RestoreReport, OpError> {
        let sector = self.settings.payload_sector();
        self.settings.access_bits.validate()?;

        self.run("restore factory keys", || {
            let mut session = handle.session();
            let mut image = CardImage::new();
            let candidates = self.candidates(&[
                (KeyType::A, KeySource::Configured),
                (KeyType::A, KeySource::Factory),
            ]);

            let used = self.authenticate(&mut session, &mut image, sector, &candidates)?;
            self.learn_access(&mut session, &mut image, sector);
            let trailer = trailer_of(sector);
            self.ensure_access(&mut session, &mut image, sector, used, &[trailer], true)?;

            let data = KeyMaterial::FACTORY.trailer(&self.settings.access_bits);
            self.write(&mut session, &mut image, trailer, &data)?;

            let key_verified = session
                .authenticate(sector, &Key::FACTORY, KeyType::A)
                .is_ok();
            if !key_verified {
                tracing::warn!("Factory key does not authenticate sector {}", sector);
            }

            Ok(RestoreReport {
                sector,
                key_verified,
            })
        })
    }

    /// Write a setup card. With `auto_increment` the lock number for the
    /// next card is returned; the engine itself keeps no batch state.
    pub fn write_setup_card<T: CardTransport>(
        &self,
        handle: &TransportHandle<T>,
        record: &SetupRecord,
        auto_increment: bool,
    ) -> Result<SetupWriteOutcome, OpError> {
        let (signature, config) = self.settings.codec.encode(record)?;
        let new_lock_no = if auto_increment {
            Some(
                self.settings
                    .sequencer
                    .next(record.lock_number, self.settings.wrap_lock_numbers)?,
            )
        } else {
            None
        };

        self.run("write setup card", || {
            let mut session = handle.session();
            let mut image = CardImage::new();
            let sector = sector_of(SETUP_CONFIG_BLOCK);
            let candidates = self.candidates(&[
                (KeyType::A, KeySource::Factory),
                (KeyType::A, KeySource::Configured),
            ]);

            let used = self.authenticate(&mut session, &mut image, sector, &candidates)?;
            self.learn_access(&mut session, &mut image, sector);
            self.ensure_access(&mut session, &mut image, sector, used, &SETUP_BLOCKS, true)?;

            self.write(&mut session, &mut image, SETUP_CONFIG_BLOCK, &config)?;
            self.write(&mut session, &mut image, SETUP_SIGNATURE_BLOCK, &signature)
                .map_err(|e| {
                    OpError::partial(1, format!("block {}", SETUP_SIGNATURE_BLOCK), e)
                })?;

            tracing::info!("Setup card written for lock {}", record.lock_number);
            Ok(SetupWriteOutcome {
                record: *record,
                new_lock_no,
            })
        })
    }

    /// Zero the two setup blocks
    pub fn clear_setup_blocks<T: CardTransport>(
        &self,
        handle: &TransportHandle<T>,
    ) -> Result<(), OpError> {
        self.run("clear setup blocks", || {
            let mut session = handle.session();
            let mut image = CardImage::new();
            let sector = sector_of(SETUP_CONFIG_BLOCK);
            let candidates = self.candidates(&[
                (KeyType::A, KeySource::Configured),
                (KeyType::A, KeySource::Factory),
            ]);

            let used = self.authenticate(&mut session, &mut image, sector, &candidates)?;
            self.learn_access(&mut session, &mut image, sector);
            self.ensure_access(&mut session, &mut image, sector, used, &SETUP_BLOCKS, true)?;

            self.write(&mut session, &mut image, SETUP_CONFIG_BLOCK, &ZERO_BLOCK)?;
            self.write(&mut session, &mut image, SETUP_SIGNATURE_BLOCK, &ZERO_BLOCK)
                .map_err(|e| {
                    OpError::partial(1, format!("block {}", SETUP_SIGNATURE_BLOCK), e)
                })?;
            Ok(())
        })
    }

    /// Compare the lock number on a setup card with the expected one.
    /// A mismatch is a normal outcome, not an error.
    pub fn check_lock_number<T: CardTransport>(
        &self,
        handle: &TransportHandle<T>,
        expected: u16,
    ) -> Result<CheckOutcome, OpError> {
        self.run("check lock number", || {
            let mut session = handle.session();
            let mut image = CardImage::new();
            let sector = sector_of(SETUP_CONFIG_BLOCK);
            let candidates = self.candidates(&[
                (KeyType::A, KeySource::Factory),
                (KeyType::A, KeySource::Configured),
            ]);

            let used = self.authenticate(&mut session, &mut image, sector, &candidates)?;
            self.learn_access(&mut session, &mut image, sector);
            self.ensure_access(&mut session, &mut image, sector, used, &SETUP_BLOCKS, false)?;
            let signature = self.read(&mut session, &mut image, SETUP_SIGNATURE_BLOCK)?;
            let config = self.read(&mut session, &mut image, SETUP_CONFIG_BLOCK)?;

            let outcome = match self.settings.codec.decode(&signature, &config)? {
                SetupState::Unprovisioned => CheckOutcome::Unprovisioned,
                SetupState::Provisioned(r) if r.lock_number == expected => CheckOutcome::Match {
                    lock_number: r.lock_number,
                },
                SetupState::Provisioned(r) => CheckOutcome::Mismatch {
                    expected,
                    found: r.lock_number,
                },
            };
            tracing::info!("Lock number check: {:?}", outcome);
            Ok(outcome)
        })
    }

    /// Decode the setup blocks without comparing
    pub fn read_setup<T: CardTransport>(
        &self,
        handle: &TransportHandle<T>,
    ) -> Result<SetupState, OpError> {
        self.run("read setup", || {
            let mut session = handle.session();
            let mut image = CardImage::new();
            let sector = sector_of(SETUP_CONFIG_BLOCK);
            let candidates = self.candidates(&[
                (KeyType::A, KeySource::Factory),
                (KeyType::A, KeySource::Configured),
            ]);

            let used = self.authenticate(&mut session, &mut image, sector, &candidates)?;
            self.learn_access(&mut session, &mut image, sector);
            self.ensure_access(&mut session, &mut image, sector, used, &SETUP_BLOCKS, false)?;
            let signature = self.read(&mut session, &mut image, SETUP_SIGNATURE_BLOCK)?;
            let config = self.read(&mut session, &mut image, SETUP_CONFIG_BLOCK)?;
            Ok(self.settings.codec.decode(&signature, &config)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessCondition, Overflow, ReaderId, SequenceError, SimulatedCard};

    fn handle(card: SimulatedCard) -> TransportHandle<SimulatedCard> {
        let reader = card.reader().clone();
        TransportHandle::new(card, reader)
    }

    fn custom_settings() -> EngineSettings {
        EngineSettings {
            keys: KeyMaterial::from_hex("A0A1A2A3A4A5", "B0B1B2B3B4B5").unwrap(),
            ..EngineSettings::default()
        }
    }

    /// Every block of the sector readable and writable with key B only
    fn key_b_policy() -> AccessBits {
        AccessBits {
            conditions: [AccessCondition::from_bits(0b011); BLOCKS_PER_SECTOR as usize],
            gpb: AccessBits::DEFAULT_GPB,
        }
    }

    fn scenario_record() -> SetupRecord {
        SetupRecord {
            lock_number: 41,
            wait_time: 5,
            sound_mode: 1,
            alarm_mode: 0,
            lock_mode: 2,
        }
    }

    #[test]
    fn test_write_setup_then_check_next_lock() {
        crate::logging::init_test();
        let engine = ProvisioningEngine::default();
        let h = handle(SimulatedCard::new("Sim"));

        let outcome = engine
            .write_setup_card(&h, &scenario_record(), true)
            .unwrap();
        assert_eq!(outcome.new_lock_no, Some(42));

        // The next card in the batch gets lock 42
        let next = SetupRecord {
            lock_number: outcome.new_lock_no.unwrap(),
            ..scenario_record()
        };
        engine.write_setup_card(&h, &next, false).unwrap();
        assert_eq!(
            engine.check_lock_number(&h, 42).unwrap(),
            CheckOutcome::Match { lock_number: 42 }
        );
        assert_eq!(
            engine.check_lock_number(&h, 41).unwrap(),
            CheckOutcome::Mismatch {
                expected: 41,
                found: 42
            }
        );
    }

    #[test]
    fn test_setup_written_config_block_first() {
        let engine = ProvisioningEngine::default();
        let h = handle(SimulatedCard::new("Sim"));
        engine
            .write_setup_card(&h, &scenario_record(), false)
            .unwrap();
        let log = h.with_transport(|card| card.write_log().to_vec());
        assert_eq!(log, vec![61, 60]);
    }

    #[test]
    fn test_invalid_record_touches_nothing() {
        let engine = ProvisioningEngine::default();
        let h = handle(SimulatedCard::new("Sim"));
        let mut record = scenario_record();
        record.lock_mode = 9;

        let err = engine.write_setup_card(&h, &record, true).unwrap_err();
        assert!(matches!(err, OpError::Format(_)));
        assert!(h.with_transport(|card| card.write_log().is_empty()));
    }

    #[test]
    fn test_check_on_cleared_card_is_unprovisioned() {
        let engine = ProvisioningEngine::default();
        let h = handle(SimulatedCard::new("Sim"));
        engine.write_setup_card(&h, &scenario_record(), false).unwrap();
        engine.clear_all_blocks(&h, false).unwrap();

        assert_eq!(
            engine.check_lock_number(&h, 42).unwrap(),
            CheckOutcome::Unprovisioned
        );
    }

    #[test]
    fn test_clear_setup_blocks() {
        let engine = ProvisioningEngine::default();
        let h = handle(SimulatedCard::new("Sim"));
        engine.write_setup_card(&h, &scenario_record(), false).unwrap();
        engine.clear_setup_blocks(&h).unwrap();

        assert_eq!(engine.read_setup(&h).unwrap(), SetupState::Unprovisioned);
    }

    #[test]
    fn test_half_written_setup_reported() {
        let engine = ProvisioningEngine::default();
        let mut card = SimulatedCard::new("Sim");
        card.fail_after_writes(1);
        let h = handle(card);

        let err = engine
            .write_setup_card(&h, &scenario_record(), false)
            .unwrap_err();
        match err {
            OpError::Partial {
                completed,
                failed_step,
                ..
            } => {
                assert_eq!(completed, 1);
                assert_eq!(failed_step, "block 60");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            engine.check_lock_number(&h, 41),
            Err(OpError::Format(FormatError::HalfWritten { .. }))
        ));
    }

    #[test]
    fn test_dump_marks_damaged_sector_unreadable() {
        crate::logging::init_test();
        let engine = ProvisioningEngine::default();
        let mut card = SimulatedCard::new("Sim");
        card.set_raw_block(4, [0x11; 16]);
        card.damage_sector(5);
        let h = handle(card);

        let report = engine.dump(&h).unwrap();
        assert_eq!(report.unreadable_sectors, vec![5]);
        assert!(report.text.contains("[S01 B0 #04] 11 11 11"));
        for block in 20..24 {
            let line = format!("#{:02}] unreadable", block);
            assert!(report.text.contains(&line), "missing {line}");
        }
        assert!(report.text.contains("[S06 B0 #24] 00 00"));
    }

    #[test]
    fn test_dump_falls_back_to_configured_key() {
        let engine = ProvisioningEngine::new(custom_settings()).unwrap();
        let h = handle(SimulatedCard::new("Sim"));
        engine.encode(&h, &CardPayload::new()).unwrap();

        let report = engine.dump(&h).unwrap();
        assert!(report.unreadable_sectors.is_empty());
        assert!(report.text.contains("--- Sector 15 (key A) ---"));
    }

    #[test]
    fn test_manufacturer_block_rejected_everywhere() {
        let payload = CardPayload::new().with_block(0, ZERO_BLOCK);
        assert!(matches!(
            payload.validate(0),
            Err(FormatError::PayloadBlock { block: 0, .. })
        ));

        let mut image = CardImage::new();
        image.mark_authenticated(0, KeyType::A);
        assert_eq!(
            image.write_block(0, ZERO_BLOCK),
            Err(AccessError::ManufacturerBlock)
        );
    }

    #[test]
    fn test_clear_twice_is_idempotent() {
        let engine = ProvisioningEngine::default();
        let mut card = SimulatedCard::new("Sim");
        for block in [1u8, 4, 17, 45, 62] {
            card.set_raw_block(block, [0xCD; 16]);
        }
        let h = handle(card);

        engine.clear_all_blocks(&h, false).unwrap();
        let once = engine.dump(&h).unwrap().text;
        engine.clear_all_blocks(&h, false).unwrap();
        let twice = engine.dump(&h).unwrap().text;

        assert_eq!(once, twice);
        assert!(!once.contains("CD CD"));
        // Manufacturer block survives
        assert!(once.contains("[S00 B0 #00] DE AD BE EF"));
    }

    #[test]
    fn test_clear_aborts_at_first_locked_sector() {
        let engine = ProvisioningEngine::default();
        let mut card = SimulatedCard::new("Sim");
        card.set_raw_block(4, [0xCD; 16]);
        card.set_raw_block(12, [0xCD; 16]);
        card.damage_sector(2);
        let h = handle(card);

        let err = engine.clear_all_blocks(&h, false).unwrap_err();
        match err {
            OpError::Partial {
                completed,
                failed_step,
                source,
            } => {
                // Sector 0 (blocks 1, 2) and sector 1 (4, 5, 6)
                assert_eq!(completed, 5);
                assert_eq!(failed_step, "sector 2");
                assert!(matches!(*source, OpError::Authentication { sector: 2 }));
            }
            other => panic!("unexpected error: {other}"),
        }

        h.with_transport(|card| {
            assert_eq!(card.raw_block(4), Some(ZERO_BLOCK));
            assert_eq!(card.raw_block(12), Some([0xCD; 16]));
        });
    }

    #[test]
    fn test_clear_skips_write_protected_blocks() {
        let engine = ProvisioningEngine::default();
        let mut card = SimulatedCard::new("Sim");
        let mut access = AccessBits::TRANSPORT;
        access.conditions[1] = AccessCondition::from_bits(0b010);
        card.set_raw_block(11, KeyMaterial::FACTORY.trailer(&access));
        card.set_raw_block(9, [0xCD; 16]);
        let h = handle(card);

        let report = engine.clear_all_blocks(&h, false).unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, 9);
        h.with_transport(|card| assert_eq!(card.raw_block(9), Some([0xCD; 16])));
    }

    #[test]
    fn test_clear_with_trailers_restores_factory_policy() {
        let engine = ProvisioningEngine::new(custom_settings()).unwrap();
        let h = handle(SimulatedCard::new("Sim"));
        engine.encode(&h, &CardPayload::new()).unwrap();

        engine.clear_all_blocks(&h, true).unwrap();
        h.with_transport(|card| {
            assert_eq!(
                card.raw_block(63),
                Some(KeyMaterial::FACTORY.trailer(&AccessBits::TRANSPORT))
            );
        });
    }

    #[test]
    fn test_encode_writes_trailer_last_and_decode_reads_back() {
        let engine = ProvisioningEngine::new(custom_settings()).unwrap();
        let h = handle(SimulatedCard::new("Sim"));

        let mut user_block = ZERO_BLOCK;
        user_block[4] = 5;
        let payload = CardPayload::new().with_block(62, user_block);

        let report = engine.encode(&h, &payload).unwrap();
        assert_eq!(report.blocks_written, vec![62, 63]);
        assert!(report.key_verified);
        assert_eq!(h.with_transport(|card| card.write_log().to_vec()), vec![62, 63]);

        let decoded = engine.decode(&h).unwrap();
        assert_eq!(decoded.sector, 15);
        assert_eq!(decoded.access_bits, AccessBits::TRANSPORT);
        assert_eq!(decoded.last_lock, Some(5));
        assert_eq!(decoded.blocks, vec![(62, user_block)]);
    }

    #[test]
    fn test_encode_failure_leaves_old_key() {
        let engine = ProvisioningEngine::new(custom_settings()).unwrap();
        let mut card = SimulatedCard::new("Sim");
        card.fail_after_writes(0);
        let h = handle(card);

        let payload = CardPayload::new().with_block(62, [1; 16]);
        assert!(engine.encode(&h, &payload).is_err());

        let mut session = h.session();
        assert!(session.authenticate(15, &Key::FACTORY, KeyType::A).is_ok());
    }

    #[test]
    fn test_decode_rejects_unencoded_card() {
        let engine = ProvisioningEngine::new(custom_settings()).unwrap();
        let h = handle(SimulatedCard::new("Sim"));
        assert!(matches!(
            engine.decode(&h),
            Err(OpError::EncodingMismatch(_))
        ));
    }

    #[test]
    fn test_decode_rejects_foreign_access_bits() {
        let mut settings = custom_settings();
        settings.access_bits.conditions[0] = AccessCondition::from_bits(0b100);
        let encoder = ProvisioningEngine::new(settings).unwrap();
        let h = handle(SimulatedCard::new("Sim"));
        encoder.encode(&h, &CardPayload::new()).unwrap();

        let checker = ProvisioningEngine::new(custom_settings()).unwrap();
        let err = checker.decode(&h).unwrap_err();
        assert!(matches!(err, OpError::EncodingMismatch(_)), "{err}");
    }

    #[test]
    fn test_restore_factory_keys() {
        let engine = ProvisioningEngine::new(custom_settings()).unwrap();
        let h = handle(SimulatedCard::new("Sim"));
        engine.encode(&h, &CardPayload::new()).unwrap();

        let report = engine.restore_factory_keys(&h).unwrap();
        assert!(report.key_verified);
        assert_eq!(report.sector, 15);
    }

    #[test]
    fn test_payload_outside_sector_rejected() {
        let engine = ProvisioningEngine::default();
        let h = handle(SimulatedCard::new("Sim"));
        for block in [33u8, 60, 63] {
            let payload = CardPayload::new().with_block(block, ZERO_BLOCK);
            assert!(matches!(
                engine.encode(&h, &payload),
                Err(OpError::Format(FormatError::PayloadBlock { .. }))
            ));
        }
    }

    #[test]
    fn test_lockout_policy_rejected_before_write() {
        let mut settings = EngineSettings::default();
        settings.access_bits.conditions[3] = AccessCondition::from_bits(0b111);
        assert!(ProvisioningEngine::new(settings).is_err());
    }

    #[test]
    fn test_cancel_stops_before_first_write() {
        let token = CancelToken::new();
        let engine = ProvisioningEngine::default().with_cancel_token(token.clone());
        let h = handle(SimulatedCard::new("Sim"));
        token.cancel();

        let err = engine
            .write_setup_card(&h, &scenario_record(), false)
            .unwrap_err();
        assert!(matches!(err, OpError::Cancelled { .. }));
        assert!(h.with_transport(|card| card.write_log().is_empty()));
    }

    #[test]
    fn test_missing_reader_is_transport_error() {
        let engine = ProvisioningEngine::default();
        let h = TransportHandle::new(SimulatedCard::new("Sim"), ReaderId::new("Other"));
        assert!(matches!(
            engine.check_lock_number(&h, 1),
            Err(OpError::Transport { .. })
        ));
    }

    #[test]
    fn test_key_b_data_policy_decodes_after_encode() {
        let settings = EngineSettings {
            access_bits: key_b_policy(),
            ..custom_settings()
        };
        let engine = ProvisioningEngine::new(settings).unwrap();
        let h = handle(SimulatedCard::new("Sim"));

        let mut user_block = ZERO_BLOCK;
        user_block[4] = 9;
        engine
            .encode(&h, &CardPayload::new().with_block(62, user_block))
            .unwrap();

        let decoded = engine.decode(&h).unwrap();
        assert_eq!(decoded.access_bits, key_b_policy());
        assert_eq!(decoded.blocks, vec![(62, user_block)]);
        assert_eq!(decoded.last_lock, Some(9));

        // Encoding again needs key B for both the data block and the trailer
        user_block[4] = 10;
        let report = engine
            .encode(&h, &CardPayload::new().with_block(62, user_block))
            .unwrap();
        assert_eq!(report.blocks_written, vec![62, 63]);
        assert_eq!(engine.decode(&h).unwrap().last_lock, Some(10));
    }

    #[test]
    fn test_setup_card_in_key_b_sector() {
        let settings = EngineSettings {
            access_bits: key_b_policy(),
            ..custom_settings()
        };
        let engine = ProvisioningEngine::new(settings).unwrap();
        let h = handle(SimulatedCard::new("Sim"));
        engine.encode(&h, &CardPayload::new()).unwrap();

        engine
            .write_setup_card(&h, &scenario_record(), false)
            .unwrap();
        assert_eq!(
            engine.check_lock_number(&h, 41).unwrap(),
            CheckOutcome::Match { lock_number: 41 }
        );

        engine.clear_setup_blocks(&h).unwrap();
        assert_eq!(engine.read_setup(&h).unwrap(), SetupState::Unprovisioned);
    }

    #[test]
    fn test_unknown_key_b_keeps_key_a_session() {
        let engine = ProvisioningEngine::new(custom_settings()).unwrap();
        let mut card = SimulatedCard::new("Sim");
        let foreign = KeyMaterial {
            key_a: Key::FACTORY,
            key_b: Key::new([0x42; 6]),
        };
        card.set_raw_block(7, foreign.trailer(&key_b_policy()));
        card.set_raw_block(4, [0xCD; 16]);
        let h = handle(card);

        let report = engine.dump(&h).unwrap();
        assert!(report.text.contains("--- Sector 01 (key A) ---"));
        assert!(report.text.contains("#04] unreadable"));
        assert!(!report.text.contains("CD CD"));
        assert!(report.unreadable_sectors.is_empty());
    }

    #[test]
    fn test_no_wrap_applies_overflow_policy() {
        let settings = EngineSettings {
            wrap_lock_numbers: false,
            ..EngineSettings::default()
        };
        let record = SetupRecord {
            lock_number: u16::MAX,
            ..scenario_record()
        };
        let h = handle(SimulatedCard::new("Sim"));

        let engine = ProvisioningEngine::new(settings.clone()).unwrap();
        assert!(matches!(
            engine.write_setup_card(&h, &record, true),
            Err(OpError::Sequence(SequenceError::Exhausted { .. }))
        ));
        assert!(h.with_transport(|card| card.write_log().is_empty()));

        let saturating = EngineSettings {
            sequencer: LockNumberSequencer {
                on_overflow: Overflow::Saturate,
                ..LockNumberSequencer::default()
            },
            ..settings
        };
        let engine = ProvisioningEngine::new(saturating).unwrap();
        let outcome = engine.write_setup_card(&h, &record, true).unwrap();
        assert_eq!(outcome.new_lock_no, Some(u16::MAX));

        // Wrapping is the default
        let engine = ProvisioningEngine::default();
        let outcome = engine.write_setup_card(&h, &record, true).unwrap();
        assert_eq!(outcome.new_lock_no, Some(1));
    }
}
