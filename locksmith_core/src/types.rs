//! Core card types for the locksmith system.
//!
//! This module defines the fundamental types used throughout the system:
//! - Card geometry (sectors, blocks, reserved indices)
//! - Authentication keys and key material
//! - Reader identifiers

use crate::FormatError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// ============================================================================
// Card Geometry (MIFARE Classic 1K)
// ============================================================================

/// Size of one block in bytes
pub const BLOCK_SIZE: usize = 16;

/// Number of sectors on the card
pub const SECTOR_COUNT: u8 = 16;

/// Blocks per sector, trailer included
pub const BLOCKS_PER_SECTOR: u8 = 4;

/// Total number of blocks on the card
pub const BLOCK_COUNT: u8 = SECTOR_COUNT * BLOCKS_PER_SECTOR;

/// Read-only manufacturer block (sector 0, block 0)
pub const MANUFACTURER_BLOCK: u8 = 0;

/// Setup signature block
pub const SETUP_SIGNATURE_BLOCK: u8 = 60;

/// Setup configuration block
pub const SETUP_CONFIG_BLOCK: u8 = 61;

/// A single 16-byte block of card memory
pub type Block = [u8; BLOCK_SIZE];

/// An all-zero block
pub const ZERO_BLOCK: Block = [0u8; BLOCK_SIZE];

/// Sector that holds an absolute block index
pub const fn sector_of(block: u8) -> u8 {
    block / BLOCKS_PER_SECTOR
}

/// Absolute index of a sector's first block
pub const fn first_block(sector: u8) -> u8 {
    sector * BLOCKS_PER_SECTOR
}

/// Absolute index of a sector's trailer block
pub const fn trailer_of(sector: u8) -> u8 {
    sector * BLOCKS_PER_SECTOR + BLOCKS_PER_SECTOR - 1
}

/// Whether an absolute index is a sector trailer
pub const fn is_trailer(block: u8) -> bool {
    block % BLOCKS_PER_SECTOR == BLOCKS_PER_SECTOR - 1
}

/// Whether an absolute index is one of the two reserved setup blocks
pub const fn is_setup_block(block: u8) -> bool {
    block == SETUP_SIGNATURE_BLOCK || block == SETUP_CONFIG_BLOCK
}

/// Render bytes as space-separated uppercase hex ("01 AB FF")
pub fn hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a hex string, ignoring whitespace
pub(crate) fn parse_hex(input: &str) -> Result<Vec<u8>, FormatError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|e| FormatError::Hex(e.to_string()))
}

/// Parse a full block from hex
pub fn block_from_hex(input: &str) -> Result<Block, FormatError> {
    let bytes = parse_hex(input)?;
    bytes.try_into().map_err(|v: Vec<u8>| FormatError::OutOfRange {
        field: "block length",
        value: v.len() as u32,
        max: BLOCK_SIZE as u32,
    })
}

// ============================================================================
// Keys
// ============================================================================

/// A 6-byte sector authentication key.
///
/// `Debug` and `Display` never show the key bytes; use [`Key::to_hex`]
/// where the value is really needed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; 6]);

impl Key {
    /// Factory default key (`FFFFFFFFFFFF`)
    pub const FACTORY: Key = Key([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Parse from 12 hex digits (case-insensitive)
    pub fn from_hex(input: &str) -> Result<Self, FormatError> {
        let bytes = parse_hex(input.trim())?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, FormatError> {
        let arr: [u8; 6] = bytes
            .try_into()
            .map_err(|_| FormatError::KeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn is_factory(&self) -> bool {
        *self == Self::FACTORY
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(******)")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_factory() {
            f.write_str("factory key")
        } else {
            f.write_str("custom key")
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Key::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Which of a sector's two keys is used to authenticate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    A,
    B,
}

impl KeyType {
    /// MIFARE authentication command code
    pub const fn auth_code(self) -> u8 {
        match self {
            KeyType::A => 0x60,
            KeyType::B => 0x61,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::A => f.write_str("A"),
            KeyType::B => f.write_str("B"),
        }
    }
}

/// The two authentication keys of a sector
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub key_a: Key,
    pub key_b: Key,
}

impl KeyMaterial {
    pub const FACTORY: KeyMaterial = KeyMaterial {
        key_a: Key::FACTORY,
        key_b: Key::FACTORY,
    };

    /// Both raw keys must be exactly 6 bytes
    pub fn validate(key_a: &[u8], key_b: &[u8]) -> Result<(), FormatError> {
        for key in [key_a, key_b] {
            if key.len() != 6 {
                return Err(FormatError::KeyLength(key.len()));
            }
        }
        Ok(())
    }

    /// Build key material from raw key bytes
    pub fn from_slices(key_a: &[u8], key_b: &[u8]) -> Result<Self, FormatError> {
        Self::validate(key_a, key_b)?;
        Ok(Self {
            key_a: Key::from_slice(key_a)?,
            key_b: Key::from_slice(key_b)?,
        })
    }

    /// Build key material from two hex strings, validating both
    pub fn from_hex(key_a: &str, key_b: &str) -> Result<Self, FormatError> {
        Self::from_slices(&parse_hex(key_a.trim())?, &parse_hex(key_b.trim())?)
    }

    /// The key for a given key type
    pub const fn key(&self, key_type: KeyType) -> &Key {
        match key_type {
            KeyType::A => &self.key_a,
            KeyType::B => &self.key_b,
        }
    }

    /// Assemble a sector trailer: key A, access bits (with GPB), key B
    pub fn trailer(&self, access: &crate::AccessBits) -> Block {
        let mut block = ZERO_BLOCK;
        block[0..6].copy_from_slice(self.key_a.as_bytes());
        block[6..10].copy_from_slice(&access.encode());
        block[10..16].copy_from_slice(self.key_b.as_bytes());
        block
    }
}

// ============================================================================
// Readers
// ============================================================================

/// Identifier of an attached card reader
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReaderId(pub String);

impl ReaderId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
