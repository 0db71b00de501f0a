//! Sector access bits.
//!
//! Each sector trailer carries three bytes of access conditions followed by a
//! general-purpose byte. Every block of the sector gets a 3-bit condition
//! `C1 C2 C3`; the bits are stored twice, once inverted, so corruption is
//! detectable:
//!
//! ```text
//! byte 6: !C2[3..0] !C1[3..0]
//! byte 7:  C1[3..0] !C3[3..0]
//! byte 8:  C3[3..0]  C2[3..0]
//! byte 9:  general purpose byte
//! ```

use crate::{types::parse_hex, FormatError, KeyType, BLOCKS_PER_SECTOR};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A 3-bit access condition (`C1 C2 C3`, C1 most significant)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccessCondition(u8);

impl AccessCondition {
    pub const fn new(c1: bool, c2: bool, c3: bool) -> Self {
        Self(((c1 as u8) << 2) | ((c2 as u8) << 1) | (c3 as u8))
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    const fn c1(self) -> u8 {
        (self.0 >> 2) & 1
    }

    const fn c2(self) -> u8 {
        (self.0 >> 1) & 1
    }

    const fn c3(self) -> u8 {
        self.0 & 1
    }

    /// Data block read permission
    pub const fn data_readable(self, key: KeyType) -> bool {
        match self.0 {
            0b000 | 0b010 | 0b100 | 0b110 | 0b001 => true,
            0b011 | 0b101 => matches!(key, KeyType::B),
            _ => false,
        }
    }

    /// Data block write permission
    pub const fn data_writable(self, key: KeyType) -> bool {
        match self.0 {
            0b000 => true,
            0b100 | 0b110 | 0b011 => matches!(key, KeyType::B),
            _ => false,
        }
    }

    /// Whether the trailer's access bits can be rewritten with `key`
    pub const fn trailer_writable(self, key: KeyType) -> bool {
        match self.0 {
            0b001 => matches!(key, KeyType::A),
            0b011 | 0b101 => matches!(key, KeyType::B),
            _ => false,
        }
    }

    /// Whether key B can be read back from the trailer with `key`
    pub const fn key_b_readable(self, key: KeyType) -> bool {
        matches!(self.0, 0b000 | 0b010 | 0b001) && matches!(key, KeyType::A)
    }

    /// Trailer conditions that can never be changed again
    pub const fn locks_trailer(self) -> bool {
        !matches!(self.0, 0b001 | 0b011 | 0b101)
    }
}

impl fmt::Display for AccessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03b}", self.0)
    }
}

/// Decoded access bits for one sector, plus the general purpose byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccessBits {
    /// Conditions for block offsets 0, 1, 2 and the trailer (3)
    pub conditions: [AccessCondition; BLOCKS_PER_SECTOR as usize],
    pub gpb: u8,
}

impl AccessBits {
    /// Factory policy `FF 07 80 69`: data blocks open to both keys,
    /// trailer rewritable with key A
    pub const TRANSPORT: AccessBits = AccessBits {
        conditions: [
            AccessCondition(0b000),
            AccessCondition(0b000),
            AccessCondition(0b000),
            AccessCondition(0b001),
        ],
        gpb: 0x69,
    };

    /// Default general purpose byte when only three bytes are given
    pub const DEFAULT_GPB: u8 = 0x69;

    /// Decode 3 access bytes, optionally followed by the general purpose byte
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() != 3 && bytes.len() != 4 {
            return Err(FormatError::AccessLength(bytes.len()));
        }
        let (b6, b7, b8) = (bytes[0], bytes[1], bytes[2]);

        let c1 = b7 >> 4;
        let c2 = b8 & 0x0F;
        let c3 = b8 >> 4;
        if (!b6 & 0x0F) != c1 || (!b6 >> 4) != c2 || (!b7 & 0x0F) != c3 {
            return Err(FormatError::AccessParity);
        }

        let mut conditions = [AccessCondition(0); BLOCKS_PER_SECTOR as usize];
        for (i, cond) in conditions.iter_mut().enumerate() {
            *cond = AccessCondition::new(
                (c1 >> i) & 1 == 1,
                (c2 >> i) & 1 == 1,
                (c3 >> i) & 1 == 1,
            );
        }

        Ok(Self {
            conditions,
            gpb: bytes.get(3).copied().unwrap_or(Self::DEFAULT_GPB),
        })
    }

    /// Encode the three access bytes
    pub fn encode_access(&self) -> [u8; 3] {
        let (mut c1, mut c2, mut c3) = (0u8, 0u8, 0u8);
        for (i, cond) in self.conditions.iter().enumerate() {
            c1 |= cond.c1() << i;
            c2 |= cond.c2() << i;
            c3 |= cond.c3() << i;
        }
        [
            ((!c2 & 0x0F) << 4) | (!c1 & 0x0F),
            (c1 << 4) | (!c3 & 0x0F),
            (c3 << 4) | c2,
        ]
    }

    /// Encode the four trailer bytes 6..10
    pub fn encode(&self) -> [u8; 4] {
        let [b6, b7, b8] = self.encode_access();
        [b6, b7, b8, self.gpb]
    }

    /// Reject policies that would permanently lock the sector trailer
    pub fn validate(&self) -> Result<(), FormatError> {
        let trailer = self.trailer_condition();
        if trailer.locks_trailer() {
            return Err(FormatError::TrailerLockout {
                condition: trailer.bits(),
            });
        }
        Ok(())
    }

    /// Parse 6 or 8 hex digits
    pub fn from_hex(input: &str) -> Result<Self, FormatError> {
        Self::decode(&parse_hex(input.trim())?)
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.encode())
    }

    pub const fn trailer_condition(&self) -> AccessCondition {
        self.conditions[BLOCKS_PER_SECTOR as usize - 1]
    }

    /// Whether a block at `offset` within the sector may be written with `key`
    pub fn can_write(&self, offset: u8, key: KeyType) -> bool {
        match self.conditions.get(offset as usize) {
            Some(cond) if offset == BLOCKS_PER_SECTOR - 1 => cond.trailer_writable(key),
            Some(cond) => cond.data_writable(key),
            None => false,
        }
    }

    /// Whether a block at `offset` within the sector may be read with `key`.
    /// Trailers are always readable (key A reads back as zeros).
    pub fn can_read(&self, offset: u8, key: KeyType) -> bool {
        match self.conditions.get(offset as usize) {
            Some(_) if offset == BLOCKS_PER_SECTOR - 1 => true,
            Some(cond) => cond.data_readable(key),
            None => false,
        }
    }
}

impl Default for AccessBits {
    fn default() -> Self {
        Self::TRANSPORT
    }
}

impl fmt::Display for AccessBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = hex::encode_upper(self.encode_access());
        write!(f, "access={} gpb={:02X}", access, self.gpb)
    }
}

impl Serialize for AccessBits {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AccessBits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AccessBits::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
