//! In-memory card image.
//!
//! A `CardImage` mirrors what one engine operation has learned about a card:
//! which sectors are authenticated (and with which key), their access bits,
//! and the blocks read so far. Writes are checked against the image before
//! they are sent to the reader.

use crate::{
    sector_of, trailer_of, types::hex_spaced, AccessBits, AccessError, Block, KeyType,
    BLOCKS_PER_SECTOR, BLOCK_COUNT, MANUFACTURER_BLOCK, SECTOR_COUNT,
};
use std::fmt::Write;

/// Authentication state of one sector in the current session
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum SectorAuth {
    #[default]
    Unknown,
    Authenticated(KeyType),
    Failed(String),
}

#[derive(Clone, Debug, Default)]
struct SectorState {
    auth: SectorAuth,
    access: Option<AccessBits>,
}

#[derive(Clone, Debug)]
enum Slot {
    Empty,
    Loaded(Block),
    Unreadable(String),
}

/// Full card image for one operation
#[derive(Clone, Debug)]
pub struct CardImage {
    blocks: Vec<Slot>,
    sectors: Vec<SectorState>,
}

impl Default for CardImage {
    fn default() -> Self {
        Self::new()
    }
}

impl CardImage {
    pub fn new() -> Self {
        Self {
            blocks: vec![Slot::Empty; BLOCK_COUNT as usize],
            sectors: vec![SectorState::default(); SECTOR_COUNT as usize],
        }
    }

    fn check_index(index: usize) -> Result<u8, AccessError> {
        if index >= BLOCK_COUNT as usize {
            return Err(AccessError::OutOfRange(index));
        }
        Ok(index as u8)
    }

    pub fn mark_authenticated(&mut self, sector: u8, key_type: KeyType) {
        if let Some(state) = self.sectors.get_mut(sector as usize) {
            state.auth = SectorAuth::Authenticated(key_type);
        }
    }

    /// Record an authentication failure; all blocks of the sector become unreadable
    pub fn mark_failed(&mut self, sector: u8, reason: impl Into<String>) {
        let reason = reason.into();
        let Some(state) = self.sectors.get_mut(sector as usize) else {
            return;
        };
        state.auth = SectorAuth::Failed(reason.clone());
        let first = (sector * BLOCKS_PER_SECTOR) as usize;
        for slot in self.blocks.iter_mut().skip(first).take(BLOCKS_PER_SECTOR as usize) {
            *slot = Slot::Unreadable(reason.clone());
        }
    }

    pub fn auth(&self, sector: u8) -> SectorAuth {
        self.sectors
            .get(sector as usize)
            .map(|s| s.auth.clone())
            .unwrap_or_default()
    }

    pub fn set_access_bits(&mut self, sector: u8, access: AccessBits) {
        if let Some(state) = self.sectors.get_mut(sector as usize) {
            state.access = Some(access);
        }
    }

    /// Access bits known for a sector, if its trailer has been seen
    pub fn access_bits(&self, sector: u8) -> Option<AccessBits> {
        self.sectors.get(sector as usize).and_then(|s| s.access)
    }

    /// Store a block received from the reader.
    ///
    /// Trailers also update the sector's access bits when they decode cleanly.
    pub fn load_block(&mut self, index: u8, data: Block) -> Result<(), AccessError> {
        let index = Self::check_index(index as usize)?;
        if crate::is_trailer(index) {
            if let Ok(access) = AccessBits::decode(&data[6..10]) {
                self.set_access_bits(sector_of(index), access);
            }
        }
        self.blocks[index as usize] = Slot::Loaded(data);
        Ok(())
    }

    pub fn mark_unreadable(&mut self, index: u8, reason: impl Into<String>) {
        if let Some(slot) = self.blocks.get_mut(index as usize) {
            *slot = Slot::Unreadable(reason.into());
        }
    }

    fn authenticated_key(&self, sector: u8) -> Result<KeyType, AccessError> {
        match self.auth(sector) {
            SectorAuth::Authenticated(key_type) => Ok(key_type),
            _ => Err(AccessError::NotAuthenticated(sector)),
        }
    }

    /// Read a block from the image
    pub fn read_block(&self, index: usize) -> Result<Block, AccessError> {
        let index = Self::check_index(index)?;
        let sector = sector_of(index);
        let key_type = self.authenticated_key(sector)?;
        let access = self.access_bits(sector).unwrap_or(AccessBits::TRANSPORT);
        if !access.can_read(index % BLOCKS_PER_SECTOR, key_type) {
            return Err(AccessError::ReadForbidden {
                sector,
                block: index,
                key_type,
            });
        }
        match &self.blocks[index as usize] {
            Slot::Loaded(data) => Ok(*data),
            _ => Err(AccessError::Unloaded(index)),
        }
    }

    /// Check a write against the image and record the new contents.
    ///
    /// The key type used to authenticate the sector decides whether the
    /// sector's access bits allow the write. Sectors whose trailer has not
    /// been seen are treated as using the transport policy.
    pub fn write_block(&mut self, index: usize, data: Block) -> Result<(), AccessError> {
        let index = self.check_write(index)?;
        self.load_block(index, data)
    }

    /// Permission check for a write, without touching the image
    pub fn check_write(&self, index: usize) -> Result<u8, AccessError> {
        if index == MANUFACTURER_BLOCK as usize {
            return Err(AccessError::ManufacturerBlock);
        }
        let index = Self::check_index(index)?;
        let sector = sector_of(index);
        let key_type = self.authenticated_key(sector)?;
        let access = self.access_bits(sector).unwrap_or(AccessBits::TRANSPORT);

        if !access.can_write(index % BLOCKS_PER_SECTOR, key_type) {
            return Err(AccessError::WriteForbidden {
                sector,
                block: index,
                key_type,
            });
        }
        Ok(index)
    }

    /// Sectors whose authentication failed
    pub fn failed_sectors(&self) -> Vec<u8> {
        self.sectors
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.auth, SectorAuth::Failed(_)))
            .map(|(i, _)| i as u8)
            .collect()
    }

    /// Human-readable hex rendering of every block, annotated by sector
    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        for sector in 0..SECTOR_COUNT {
            let header = match self.auth(sector) {
                SectorAuth::Authenticated(key_type) => format!("key {}", key_type),
                SectorAuth::Failed(reason) => format!("unreadable: {}", reason),
                SectorAuth::Unknown => "not read".to_string(),
            };
            let _ = writeln!(out, "--- Sector {:02} ({}) ---", sector, header);

            let first = sector * BLOCKS_PER_SECTOR;
            for index in first..first + BLOCKS_PER_SECTOR {
                let _ = write!(
                    out,
                    "[S{:02} B{} #{:02}] ",
                    sector,
                    index - first,
                    index
                );
                match &self.blocks[index as usize] {
                    Slot::Loaded(data) => {
                        out.push_str(&hex_spaced(data));
                        if index == trailer_of(sector) {
                            match AccessBits::decode(&data[6..10]) {
                                Ok(access) => {
                                    let _ = write!(out, "  {}", access);
                                }
                                Err(e) => {
                                    let _ = write!(out, "  access=invalid ({})", e);
                                }
                            }
                        }
                    }
                    Slot::Unreadable(reason) => {
                        let _ = write!(out, "unreadable ({})", reason);
                    }
                    Slot::Empty => out.push_str("not read"),
                }
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessCondition, ZERO_BLOCK};

    #[test]
    fn test_manufacturer_block_never_writable() {
        let mut image = CardImage::new();
        assert_eq!(
            image.write_block(0, ZERO_BLOCK),
            Err(AccessError::ManufacturerBlock)
        );
        image.mark_authenticated(0, KeyType::A);
        assert_eq!(
            image.write_block(0, ZERO_BLOCK),
            Err(AccessError::ManufacturerBlock)
        );
        image.mark_authenticated(0, KeyType::B);
        assert_eq!(
            image.write_block(0, ZERO_BLOCK),
            Err(AccessError::ManufacturerBlock)
        );
    }

    #[test]
    fn test_out_of_range() {
        let image = CardImage::new();
        assert_eq!(image.read_block(64), Err(AccessError::OutOfRange(64)));
    }

    #[test]
    fn test_read_requires_authentication() {
        let mut image = CardImage::new();
        image.load_block(5, [7u8; 16]).unwrap();
        assert_eq!(image.read_block(5), Err(AccessError::NotAuthenticated(1)));

        image.mark_authenticated(1, KeyType::A);
        assert_eq!(image.read_block(5).unwrap(), [7u8; 16]);
        assert_eq!(image.read_block(6), Err(AccessError::Unloaded(6)));
    }

    #[test]
    fn test_write_respects_access_bits() {
        let mut image = CardImage::new();
        image.mark_authenticated(2, KeyType::A);

        let mut access = AccessBits::TRANSPORT;
        access.conditions[0] = AccessCondition::from_bits(0b100);
        image.set_access_bits(2, access);

        assert_eq!(
            image.write_block(8, ZERO_BLOCK),
            Err(AccessError::WriteForbidden {
                sector: 2,
                block: 8,
                key_type: KeyType::A
            })
        );
        assert!(image.write_block(9, ZERO_BLOCK).is_ok());
    }

    #[test]
    fn test_read_respects_access_bits() {
        let mut image = CardImage::new();
        image.mark_authenticated(3, KeyType::A);
        let mut access = AccessBits::TRANSPORT;
        access.conditions[2] = AccessCondition::from_bits(0b011);
        image.set_access_bits(3, access);
        image.load_block(14, [1; 16]).unwrap();

        assert_eq!(
            image.read_block(14),
            Err(AccessError::ReadForbidden {
                sector: 3,
                block: 14,
                key_type: KeyType::A
            })
        );
        // Trailers stay readable
        image.load_block(15, [0; 16]).unwrap();
        image.set_access_bits(3, access);
        assert!(image.read_block(15).is_ok());
    }

    #[test]
    fn test_trailer_load_updates_access_bits() {
        let mut image = CardImage::new();
        let trailer = crate::KeyMaterial::FACTORY.trailer(&AccessBits::TRANSPORT);
        image.load_block(7, trailer).unwrap();
        assert_eq!(image.access_bits(1), Some(AccessBits::TRANSPORT));
    }

    #[test]
    fn test_dump_text_marks_failed_sector() {
        let mut image = CardImage::new();
        image.mark_authenticated(0, KeyType::A);
        image.load_block(1, [0xAB; 16]).unwrap();
        image.mark_failed(3, "authentication failed");

        let text = image.dump_text();
        assert!(text.contains("--- Sector 00 (key A) ---"));
        assert!(text.contains("[S00 B1 #01] AB AB"));
        assert!(text.contains("--- Sector 03 (unreadable: authentication failed) ---"));
        assert!(text.contains("[S03 B2 #14] unreadable (authentication failed)"));
        assert_eq!(image.failed_sectors(), vec![3]);
        assert_eq!(text, image.dump_text());
    }
}
