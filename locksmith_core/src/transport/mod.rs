//! Card reader capability.
//!
//! The engine talks to cards only through [`CardTransport`]. One backend is
//! chosen at startup and wrapped in a [`TransportHandle`], which serialises
//! every operation on that reader.

use crate::{Block, Key, KeyType, ReaderId, TransportError};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;

pub mod sim;

#[cfg(feature = "pcsc")]
pub mod pcsc;

pub use sim::SimulatedCard;

#[cfg(feature = "pcsc")]
pub use self::pcsc::PcscTransport;

/// Low-level access to a MIFARE Classic card through a reader
pub trait CardTransport {
    /// Fresh snapshot of the attached readers
    fn list_readers(&self) -> Result<Vec<ReaderId>, TransportError>;

    fn authenticate(
        &mut self,
        reader: &ReaderId,
        sector: u8,
        key: &Key,
        key_type: KeyType,
    ) -> Result<(), TransportError>;

    fn read_block(&mut self, reader: &ReaderId, block: u8) -> Result<Block, TransportError>;

    fn write_block(
        &mut self,
        reader: &ReaderId,
        block: u8,
        data: &Block,
    ) -> Result<(), TransportError>;
}

/// A transport bound to one reader.
///
/// At most one operation runs against a handle at a time; handles for
/// different readers are independent.
pub struct TransportHandle<T> {
    reader: ReaderId,
    inner: Mutex<T>,
}

impl<T> fmt::Debug for TransportHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("reader", &self.reader)
            .field("busy", &self.inner.is_locked())
            .finish()
    }
}

impl<T: CardTransport> TransportHandle<T> {
    pub fn new(transport: T, reader: ReaderId) -> Self {
        Self {
            reader,
            inner: Mutex::new(transport),
        }
    }

    pub fn reader(&self) -> &ReaderId {
        &self.reader
    }

    /// Lock the handle for the duration of one operation
    pub fn session(&self) -> Session<'_, T> {
        let guard = self.inner.lock();
        tracing::trace!("Acquired reader {}", self.reader);
        Session {
            reader: &self.reader,
            transport: guard,
        }
    }

    /// Run a closure with exclusive access to the underlying transport
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Exclusive access to one reader for the length of an operation
pub struct Session<'a, T> {
    reader: &'a ReaderId,
    transport: MutexGuard<'a, T>,
}

impl<T: CardTransport> Session<'_, T> {
    pub fn reader(&self) -> &ReaderId {
        self.reader
    }

    pub fn authenticate(
        &mut self,
        sector: u8,
        key: &Key,
        key_type: KeyType,
    ) -> Result<(), TransportError> {
        self.transport
            .authenticate(self.reader, sector, key, key_type)
    }

    pub fn read_block(&mut self, block: u8) -> Result<Block, TransportError> {
        self.transport.read_block(self.reader, block)
    }

    pub fn write_block(&mut self, block: u8, data: &Block) -> Result<(), TransportError> {
        self.transport.write_block(self.reader, block, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sessions_on_one_handle_do_not_interleave() {
        let card = SimulatedCard::new("Sim 0");
        let handle = Arc::new(TransportHandle::new(card, ReaderId::new("Sim 0")));

        let workers: Vec<_> = (0..4u8)
            .map(|i| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || {
                    let mut session = handle.session();
                    let sector = i + 1;
                    session
                        .authenticate(sector, &Key::FACTORY, KeyType::A)
                        .unwrap();
                    thread::yield_now();
                    // Still authenticated to our own sector
                    let block = crate::first_block(sector);
                    session.write_block(block, &[i; 16]).unwrap();
                    assert_eq!(session.read_block(block).unwrap(), [i; 16]);
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_list_readers_snapshot() {
        let handle = TransportHandle::new(SimulatedCard::new("Sim A"), ReaderId::new("Sim A"));
        let readers = handle.with_transport(|t| t.list_readers()).unwrap();
        assert_eq!(readers, vec![ReaderId::new("Sim A")]);
    }
}
