//! Setup block codec.
//!
//! A setup card carries lock configuration in two reserved blocks. Format
//! version 1:
//!
//! ```text
//! block 60: "HN19M-1" 00 00 00 00 00 00 00 00 00
//! block 61: AA FL AA LM WT 00 LN LN K0 K1 K2 K3 K4 K5 00 CS
//!
//!   FL  flags: bits 4-5 set, bits 0-1 sound code, bits 6-7 alarm code
//!   LM  lock mode          WT  wait time
//!   LN  lock number (LE)   K*  setup key
//!   CS  XOR of block 60 and bytes 0..15 of block 61
//! ```
//!
//! Changing any offset breaks every card already in the field; bump
//! [`SETUP_FORMAT_VERSION`] if it ever has to happen.

use crate::{Block, FormatError, Key, SETUP_CONFIG_BLOCK, SETUP_SIGNATURE_BLOCK, ZERO_BLOCK};
use serde::{Deserialize, Serialize};

pub const SETUP_FORMAT_VERSION: u8 = 1;

/// Signature at the start of block 60
pub const SETUP_SIGNATURE: &[u8; 7] = b"HN19M-1";

pub const MAX_SOUND_MODE: u8 = 3;
pub const MAX_ALARM_MODE: u8 = 2;
pub const MAX_LOCK_MODE: u8 = 3;

const MARKER: u8 = 0xAA;
const FIXED_FLAGS: u8 = 0x30;
const RESERVED_FLAGS: u8 = 0x0C;

/// Logical lock configuration stored on a setup card
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupRecord {
    pub lock_number: u16,
    /// Seconds the lock stays open
    pub wait_time: u8,
    pub sound_mode: u8,
    pub alarm_mode: u8,
    pub lock_mode: u8,
}

impl SetupRecord {
    /// Range-check every field
    pub fn validate(&self) -> Result<(), FormatError> {
        let checks = [
            ("sound_mode", self.sound_mode, MAX_SOUND_MODE),
            ("alarm_mode", self.alarm_mode, MAX_ALARM_MODE),
            ("lock_mode", self.lock_mode, MAX_LOCK_MODE),
        ];
        for (field, value, max) in checks {
            if value > max {
                return Err(FormatError::OutOfRange {
                    field,
                    value: value as u32,
                    max: max as u32,
                });
            }
        }
        Ok(())
    }
}

/// Decoded contents of the setup blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SetupState {
    /// Both blocks blank (all 0x00 or all 0xFF)
    Unprovisioned,
    Provisioned(SetupRecord),
}

/// Bit-level encoder/decoder for the two setup blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupBlockCodec {
    setup_key: Key,
}

impl Default for SetupBlockCodec {
    fn default() -> Self {
        Self::new(Key::FACTORY)
    }
}

// Sound modes 1 and 2 swap their bits on the wire.
const fn sound_code(mode: u8) -> u8 {
    ((mode & 0b01) << 1) | ((mode & 0b10) >> 1)
}

const fn alarm_code(mode: u8) -> u8 {
    match mode {
        0 => 0b00,
        1 => 0b10,
        _ => 0b11,
    }
}

fn is_blank(block: &Block) -> bool {
    block.iter().all(|&b| b == 0x00) || block.iter().all(|&b| b == 0xFF)
}

fn checksum(signature: &Block, config: &Block) -> u8 {
    signature
        .iter()
        .chain(config[..15].iter())
        .fold(0u8, |acc, b| acc ^ b)
}

fn reserved(offset: usize, value: u8) -> FormatError {
    FormatError::Reserved {
        block: SETUP_CONFIG_BLOCK,
        offset,
        value,
    }
}

impl SetupBlockCodec {
    pub const fn new(setup_key: Key) -> Self {
        Self { setup_key }
    }

    /// Pack a record into (block 60, block 61)
    pub fn encode(&self, record: &SetupRecord) -> Result<(Block, Block), FormatError> {
        record.validate()?;

        let mut signature = ZERO_BLOCK;
        signature[..SETUP_SIGNATURE.len()].copy_from_slice(SETUP_SIGNATURE);

        let mut config = ZERO_BLOCK;
        config[0] = MARKER;
        config[1] =
            (alarm_code(record.alarm_mode) << 6) | FIXED_FLAGS | sound_code(record.sound_mode);
        config[2] = MARKER;
        config[3] = record.lock_mode;
        config[4] = record.wait_time;
        config[6..8].copy_from_slice(&record.lock_number.to_le_bytes());
        config[8..14].copy_from_slice(self.setup_key.as_bytes());
        config[15] = checksum(&signature, &config);

        Ok((signature, config))
    }

    /// Unpack (block 60, block 61)
    pub fn decode(&self, signature: &Block, config: &Block) -> Result<SetupState, FormatError> {
        match (is_blank(signature), is_blank(config)) {
            (true, true) => return Ok(SetupState::Unprovisioned),
            (true, false) => {
                return Err(FormatError::HalfWritten {
                    blank: SETUP_SIGNATURE_BLOCK,
                    written: SETUP_CONFIG_BLOCK,
                })
            }
            (false, true) => {
                return Err(FormatError::HalfWritten {
                    blank: SETUP_CONFIG_BLOCK,
                    written: SETUP_SIGNATURE_BLOCK,
                })
            }
            (false, false) => {}
        }

        let sig_len = SETUP_SIGNATURE.len();
        if &signature[..sig_len] != SETUP_SIGNATURE || signature[sig_len..].iter().any(|&b| b != 0)
        {
            return Err(FormatError::Signature);
        }

        let expected = checksum(signature, config);
        if config[15] != expected {
            return Err(FormatError::Checksum {
                expected,
                found: config[15],
            });
        }

        for offset in [0, 2] {
            if config[offset] != MARKER {
                return Err(reserved(offset, config[offset]));
            }
        }
        for offset in [5, 14] {
            if config[offset] != 0 {
                return Err(reserved(offset, config[offset]));
            }
        }

        let flags = config[1];
        if flags & FIXED_FLAGS != FIXED_FLAGS || flags & RESERVED_FLAGS != 0 {
            return Err(reserved(1, flags));
        }
        let alarm_mode = match flags >> 6 {
            0b00 => 0,
            0b10 => 1,
            0b11 => 2,
            _ => return Err(reserved(1, flags)),
        };

        let lock_mode = config[3];
        if lock_mode > MAX_LOCK_MODE {
            return Err(reserved(3, lock_mode));
        }

        Ok(SetupState::Provisioned(SetupRecord {
            lock_number: u16::from_le_bytes([config[6], config[7]]),
            wait_time: config[4],
            sound_mode: sound_code(flags & 0b11),
            alarm_mode,
            lock_mode,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hex_spaced;

    fn record(lock_number: u16) -> SetupRecord {
        SetupRecord {
            lock_number,
            wait_time: 5,
            sound_mode: 1,
            alarm_mode: 0,
            lock_mode: 2,
        }
    }

    #[test]
    fn test_encode_layout() {
        let codec = SetupBlockCodec::default();
        let (signature, config) = codec.encode(&record(41)).unwrap();

        assert_eq!(
            hex_spaced(&signature),
            "48 4E 31 39 4D 2D 31 00 00 00 00 00 00 00 00 00"
        );
        assert_eq!(
            hex_spaced(&config[..15]),
            "AA 32 AA 02 05 00 29 00 FF FF FF FF FF FF 00"
        );
    }

    #[test]
    fn test_roundtrip_across_field_bounds() {
        let codec = SetupBlockCodec::new(Key::new([1, 2, 3, 4, 5, 6]));
        for lock_number in [0u16, 1, 255, 256, 41, 65534, 65535] {
            for sound_mode in 0..=MAX_SOUND_MODE {
                for alarm_mode in 0..=MAX_ALARM_MODE {
                    for lock_mode in 0..=MAX_LOCK_MODE {
                        for wait_time in [0u8, 5, 255] {
                            let r = SetupRecord {
                                lock_number,
                                wait_time,
                                sound_mode,
                                alarm_mode,
                                lock_mode,
                            };
                            let (a, b) = codec.encode(&r).unwrap();
                            assert_eq!(codec.decode(&a, &b).unwrap(), SetupState::Provisioned(r));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_fields_rejected() {
        let codec = SetupBlockCodec::default();
        let mut r = record(1);
        r.sound_mode = 4;
        assert_eq!(
            codec.encode(&r),
            Err(FormatError::OutOfRange {
                field: "sound_mode",
                value: 4,
                max: 3
            })
        );

        let mut r = record(1);
        r.alarm_mode = 3;
        assert!(matches!(
            codec.encode(&r),
            Err(FormatError::OutOfRange { field: "alarm_mode", .. })
        ));
    }

    #[test]
    fn test_blank_blocks_are_unprovisioned() {
        let codec = SetupBlockCodec::default();
        assert_eq!(
            codec.decode(&ZERO_BLOCK, &ZERO_BLOCK).unwrap(),
            SetupState::Unprovisioned
        );
        assert_eq!(
            codec.decode(&[0xFF; 16], &[0xFF; 16]).unwrap(),
            SetupState::Unprovisioned
        );
        assert_eq!(
            codec.decode(&ZERO_BLOCK, &[0xFF; 16]).unwrap(),
            SetupState::Unprovisioned
        );
    }

    #[test]
    fn test_half_written_detected() {
        let codec = SetupBlockCodec::default();
        let (_, config) = codec.encode(&record(7)).unwrap();
        assert_eq!(
            codec.decode(&ZERO_BLOCK, &config),
            Err(FormatError::HalfWritten {
                blank: 60,
                written: 61
            })
        );
    }

    #[test]
    fn test_reserved_alarm_code_rejected() {
        let codec = SetupBlockCodec::default();
        let (signature, mut config) = codec.encode(&record(7)).unwrap();
        config[1] = (config[1] & 0x3F) | 0x40;
        config[15] = checksum(&signature, &config);
        assert!(matches!(
            codec.decode(&signature, &config),
            Err(FormatError::Reserved { offset: 1, .. })
        ));
    }

    #[test]
    fn test_corruption_fails_checksum() {
        let codec = SetupBlockCodec::default();
        let (signature, mut config) = codec.encode(&record(7)).unwrap();
        config[6] ^= 0x01;
        assert!(matches!(
            codec.decode(&signature, &config),
            Err(FormatError::Checksum { .. })
        ));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let codec = SetupBlockCodec::default();
        let (_, config) = codec.encode(&record(7)).unwrap();
        let mut foreign = ZERO_BLOCK;
        foreign[..4].copy_from_slice(b"ABCD");
        assert_eq!(codec.decode(&foreign, &config), Err(FormatError::Signature));
    }
}
