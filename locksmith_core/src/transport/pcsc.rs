//! PC/SC reader backend for ACR122-style contactless readers.
//!
//! MIFARE Classic commands are sent as the reader's pseudo-APDUs
//! (class `FF`): load key, general authenticate, read binary, update binary.

use super::CardTransport;
use crate::{Block, Key, KeyType, ReaderId, TransportError, BLOCK_SIZE, BLOCKS_PER_SECTOR};
use pcsc::{Card, Context, Protocols, Scope, ShareMode};
use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;

// Reader key slot used for every authentication
const KEY_SLOT: u8 = 0x00;

const SW_OK: (u8, u8) = (0x90, 0x00);

fn load_key_apdu(key: &Key) -> Vec<u8> {
    let mut apdu = vec![0xFF, 0x82, 0x00, KEY_SLOT, 0x06];
    apdu.extend_from_slice(key.as_bytes());
    apdu
}

fn authenticate_apdu(block: u8, key_type: KeyType) -> [u8; 10] {
    [
        0xFF,
        0x86,
        0x00,
        0x00,
        0x05,
        0x01,
        0x00,
        block,
        key_type.auth_code(),
        KEY_SLOT,
    ]
}

fn read_apdu(block: u8) -> [u8; 5] {
    [0xFF, 0xB0, 0x00, block, BLOCK_SIZE as u8]
}

fn write_apdu(block: u8, data: &Block) -> Vec<u8> {
    let mut apdu = vec![0xFF, 0xD6, 0x00, block, BLOCK_SIZE as u8];
    apdu.extend_from_slice(data);
    apdu
}

/// Split a response into payload and status word
fn split_status(response: &[u8]) -> Result<(&[u8], (u8, u8)), TransportError> {
    match response {
        [data @ .., sw1, sw2] => Ok((data, (*sw1, *sw2))),
        _ => Err(TransportError::ShortRead(response.len())),
    }
}

fn map_pcsc(reader: &ReaderId, e: pcsc::Error) -> TransportError {
    match e {
        pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard => {
            TransportError::NoCard(reader.to_string())
        }
        pcsc::Error::UnknownReader | pcsc::Error::ReaderUnavailable => {
            TransportError::ReaderNotFound(reader.to_string())
        }
        pcsc::Error::NoReadersAvailable => TransportError::NoReaders,
        other => TransportError::Other(other.to_string()),
    }
}

/// Transport over the system PC/SC service
pub struct PcscTransport {
    context: Context,
    cards: HashMap<ReaderId, Card>,
}

impl fmt::Debug for PcscTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscTransport")
            .field("connected", &self.cards.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PcscTransport {
    pub fn new() -> Result<Self, TransportError> {
        let context = Context::establish(Scope::User)
            .map_err(|e| TransportError::Other(format!("PC/SC unavailable: {}", e)))?;
        Ok(Self {
            context,
            cards: HashMap::new(),
        })
    }

    fn connect(&mut self, reader: &ReaderId) -> Result<&Card, TransportError> {
        if !self.cards.contains_key(reader) {
            let name = CString::new(reader.as_str())
                .map_err(|_| TransportError::ReaderNotFound(reader.to_string()))?;
            let card = self
                .context
                .connect(&name, ShareMode::Shared, Protocols::ANY)
                .map_err(|e| map_pcsc(reader, e))?;
            tracing::debug!("Connected to card on {}", reader);
            self.cards.insert(reader.clone(), card);
        }
        self.cards
            .get(reader)
            .ok_or_else(|| TransportError::NoCard(reader.to_string()))
    }

    /// Send one APDU, reconnecting once if the card was reset
    fn transmit(&mut self, reader: &ReaderId, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut buffer = [0u8; 258];
        let first = {
            let card = self.connect(reader)?;
            card.transmit(apdu, &mut buffer).map(<[u8]>::to_vec)
        };

        match first {
            Ok(response) => Ok(response),
            Err(e @ (pcsc::Error::ResetCard | pcsc::Error::RemovedCard)) => {
                self.cards.remove(reader);
                if e != pcsc::Error::ResetCard {
                    return Err(map_pcsc(reader, e));
                }
                tracing::debug!("Card on {} was reset, reconnecting", reader);
                let card = self.connect(reader)?;
                card.transmit(apdu, &mut buffer)
                    .map(<[u8]>::to_vec)
                    .map_err(|e| map_pcsc(reader, e))
            }
            Err(e) => Err(map_pcsc(reader, e)),
        }
    }

    fn command(&mut self, reader: &ReaderId, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let response = self.transmit(reader, apdu)?;
        let (data, sw) = split_status(&response)?;
        if sw != SW_OK {
            return Err(TransportError::Status {
                sw1: sw.0,
                sw2: sw.1,
            });
        }
        Ok(data.to_vec())
    }
}

impl CardTransport for PcscTransport {
    fn list_readers(&self) -> Result<Vec<ReaderId>, TransportError> {
        let names = match self.context.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(TransportError::Other(e.to_string())),
        };
        Ok(names
            .into_iter()
            .map(|name| ReaderId::new(name.to_string_lossy().into_owned()))
            .collect())
    }

    fn authenticate(
        &mut self,
        reader: &ReaderId,
        sector: u8,
        key: &Key,
        key_type: KeyType,
    ) -> Result<(), TransportError> {
        self.command(reader, &load_key_apdu(key))?;
        let block = sector * BLOCKS_PER_SECTOR;
        match self.command(reader, &authenticate_apdu(block, key_type)) {
            Ok(_) => Ok(()),
            Err(TransportError::Status { .. }) => Err(TransportError::AuthRejected(sector)),
            Err(e) => Err(e),
        }
    }

    fn read_block(&mut self, reader: &ReaderId, block: u8) -> Result<Block, TransportError> {
        let data = self.command(reader, &read_apdu(block))?;
        Block::try_from(data.as_slice()).map_err(|_| TransportError::ShortRead(data.len()))
    }

    fn write_block(
        &mut self,
        reader: &ReaderId,
        block: u8,
        data: &Block,
    ) -> Result<(), TransportError> {
        self.command(reader, &write_apdu(block, data))?;
        Ok(())
    }
}
