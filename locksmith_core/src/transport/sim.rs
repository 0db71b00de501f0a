//! Simulated MIFARE Classic 1K card and reader.
//!
//! The simulation enforces keys and access bits the way a real card does,
//! which makes it usable both as a test double and as a CLI backend (the
//! card is persisted as JSON between runs).

use super::CardTransport;
use crate::{
    is_trailer, sector_of, trailer_of, AccessBits, Block, Key, KeyMaterial, KeyType, ReaderId,
    Result, TransportError, BLOCK_COUNT, BLOCKS_PER_SECTOR, MANUFACTURER_BLOCK, SECTOR_COUNT,
    ZERO_BLOCK,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

// MIFARE status words returned by common readers
const SW_SECURITY: (u8, u8) = (0x69, 0x82);
const SW_NOT_ALLOWED: (u8, u8) = (0x69, 0x86);
const SW_WRONG_P1P2: (u8, u8) = (0x6A, 0x86);

fn status((sw1, sw2): (u8, u8)) -> TransportError {
    TransportError::Status { sw1, sw2 }
}

mod block_hex {
    use crate::{Block, BLOCK_COUNT};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(blocks: &[Block], serializer: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<String> = blocks.iter().map(hex::encode_upper).collect();
        rows.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Block>, D::Error> {
        let rows = Vec::<String>::deserialize(deserializer)?;
        if rows.len() != BLOCK_COUNT as usize {
            return Err(serde::de::Error::custom(format!(
                "card holds {} blocks, expected {}",
                rows.len(),
                BLOCK_COUNT
            )));
        }
        rows.iter()
            .map(|row| crate::block_from_hex(row).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// An in-memory card sitting on a single simulated reader
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulatedCard {
    reader: ReaderId,
    #[serde(with = "block_hex")]
    blocks: Vec<Block>,

    /// Sectors that refuse every key, as if damaged
    #[serde(default)]
    damaged_sectors: BTreeSet<u8>,

    #[serde(skip)]
    session: Option<(u8, KeyType)>,

    /// Writes accepted before the card starts failing them
    #[serde(skip)]
    write_budget: Option<usize>,

    #[serde(skip)]
    write_log: Vec<u8>,
}

impl SimulatedCard {
    /// A factory-fresh card: zeroed data, transport trailers, factory keys
    pub fn new(reader: impl Into<String>) -> Self {
        let mut blocks = vec![ZERO_BLOCK; BLOCK_COUNT as usize];
        blocks[MANUFACTURER_BLOCK as usize] = [
            0xDE, 0xAD, 0xBE, 0xEF, 0x22, 0x08, 0x04, 0x00, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67,
            0x68, 0x69,
        ];
        let trailer = KeyMaterial::FACTORY.trailer(&AccessBits::TRANSPORT);
        for sector in 0..SECTOR_COUNT {
            blocks[trailer_of(sector) as usize] = trailer;
        }

        Self {
            reader: ReaderId::new(reader),
            blocks,
            damaged_sectors: BTreeSet::new(),
            session: None,
            write_budget: None,
            write_log: Vec::new(),
        }
    }

    /// Load a card file, or create a fresh card if it does not exist
    pub fn load_or_new(path: &Path, reader: &str) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No card file at {:?}, starting with a blank card", path);
            return Ok(Self::new(reader));
        }
        let contents = std::fs::read_to_string(path)?;
        let card: SimulatedCard = serde_json::from_str(&contents)?;
        tracing::debug!("Loaded simulated card from {:?}", path);
        Ok(card)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        tracing::debug!("Saved simulated card to {:?}", path);
        Ok(())
    }

    pub fn reader(&self) -> &ReaderId {
        &self.reader
    }

    /// Raw block contents, bypassing keys
    pub fn raw_block(&self, block: u8) -> Option<Block> {
        self.blocks.get(block as usize).copied()
    }

    /// Overwrite a block, bypassing keys. Out-of-range blocks are ignored.
    pub fn set_raw_block(&mut self, block: u8, data: Block) {
        if let Some(slot) = self.blocks.get_mut(block as usize) {
            *slot = data;
        }
    }

    /// Make a sector reject every key
    pub fn damage_sector(&mut self, sector: u8) {
        self.damaged_sectors.insert(sector);
    }

    /// Accept only `writes` more block writes, failing the rest
    pub fn fail_after_writes(&mut self, writes: usize) {
        self.write_budget = Some(writes);
    }

    /// Block indices written so far, in order
    pub fn write_log(&self) -> &[u8] {
        &self.write_log
    }

    fn check_reader(&self, reader: &ReaderId) -> std::result::Result<(), TransportError> {
        if reader != &self.reader {
            return Err(TransportError::ReaderNotFound(reader.to_string()));
        }
        Ok(())
    }

    fn trailer_parts(&self, sector: u8) -> (Key, AccessBits, Key) {
        let trailer = self
            .blocks
            .get(trailer_of(sector) as usize)
            .copied()
            .unwrap_or(ZERO_BLOCK);
        let key_a = Key::from_slice(&trailer[0..6]).unwrap_or(Key::FACTORY);
        let key_b = Key::from_slice(&trailer[10..16]).unwrap_or(Key::FACTORY);
        // A trailer with corrupt access bits locks the sector for good
        let access = AccessBits::decode(&trailer[6..10]).unwrap_or(AccessBits {
            conditions: [crate::AccessCondition::from_bits(0b111); BLOCKS_PER_SECTOR as usize],
            gpb: trailer[9],
        });
        (key_a, access, key_b)
    }

    /// Key type authenticated for the sector holding `block`
    fn session_for(&self, block: u8) -> std::result::Result<KeyType, TransportError> {
        if block >= BLOCK_COUNT {
            return Err(status(SW_WRONG_P1P2));
        }
        match self.session {
            Some((sector, key_type)) if sector == sector_of(block) => Ok(key_type),
            _ => Err(status(SW_SECURITY)),
        }
    }
}

impl CardTransport for SimulatedCard {
    fn list_readers(&self) -> std::result::Result<Vec<ReaderId>, TransportError> {
        Ok(vec![self.reader.clone()])
    }

    fn authenticate(
        &mut self,
        reader: &ReaderId,
        sector: u8,
        key: &Key,
        key_type: KeyType,
    ) -> std::result::Result<(), TransportError> {
        self.check_reader(reader)?;
        self.session = None;

        if sector >= SECTOR_COUNT {
            return Err(status(SW_WRONG_P1P2));
        }
        if self.damaged_sectors.contains(&sector) {
            return Err(TransportError::AuthRejected(sector));
        }

        let (key_a, _, key_b) = self.trailer_parts(sector);
        let expected = match key_type {
            KeyType::A => key_a,
            KeyType::B => key_b,
        };
        if *key != expected {
            return Err(TransportError::AuthRejected(sector));
        }

        self.session = Some((sector, key_type));
        Ok(())
    }

    fn read_block(
        &mut self,
        reader: &ReaderId,
        block: u8,
    ) -> std::result::Result<Block, TransportError> {
        self.check_reader(reader)?;
        let key_type = self.session_for(block)?;
        let sector = sector_of(block);
        let (_, access, _) = self.trailer_parts(sector);
        let offset = block % BLOCKS_PER_SECTOR;

        if !access.can_read(offset, key_type) {
            return Err(status(SW_SECURITY));
        }

        let mut data = self
            .blocks
            .get(block as usize)
            .copied()
            .ok_or_else(|| status(SW_WRONG_P1P2))?;
        if is_trailer(block) {
            // Key A never reads back; key B only under some conditions
            data[0..6].fill(0);
            if !access.trailer_condition().key_b_readable(key_type) {
                data[10..16].fill(0);
            }
        }
        Ok(data)
    }

    fn write_block(
        &mut self,
        reader: &ReaderId,
        block: u8,
        data: &Block,
    ) -> std::result::Result<(), TransportError> {
        self.check_reader(reader)?;
        let key_type = self.session_for(block)?;

        if block == MANUFACTURER_BLOCK {
            return Err(status(SW_NOT_ALLOWED));
        }

        let (_, access, _) = self.trailer_parts(sector_of(block));
        if !access.can_write(block % BLOCKS_PER_SECTOR, key_type) {
            return Err(status(SW_SECURITY));
        }

        if let Some(budget) = self.write_budget.as_mut() {
            if *budget == 0 {
                return Err(TransportError::Other("card removed during write".into()));
            }
            *budget -= 1;
        }

        let slot = self
            .blocks
            .get_mut(block as usize)
            .ok_or_else(|| status(SW_WRONG_P1P2))?;
        *slot = *data;
        self.write_log.push(block);
        if is_trailer(block) {
            // New keys take effect at the next authentication
            self.session = None;
        }
        Ok(())
    }
}
