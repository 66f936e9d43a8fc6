//! Request transport between a client and the file server.
//!
//! The kernel IPC moves a 32-byte message and lets the receiver copy larger
//! payloads directly out of (and into) the sender's memory. Here that memory
//! surface is a [`ClientMemory`] handle: the client registers each buffer
//! under the address it wrote into the message, the handle travels with the
//! request, and the server addresses it with the same copy-in/copy-out
//! operations the kernel primitive provides.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::proto::Message;

/// Failure while addressing a sender's registered buffers.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The message named an address the sender never registered.
    #[error("no buffer registered at address {0:#x}")]
    UnknownAddress(u64),
    /// A copy-out would overrun the registered buffer.
    #[error("copy of {len} bytes overruns buffer of {cap} at address {addr:#x}")]
    OutOfBounds {
        /// Address named by the message.
        addr: u64,
        /// Bytes the copy attempted to place.
        len: usize,
        /// Capacity of the registered buffer.
        cap: usize,
    },
}

/// The sender-side memory reachable from a single request.
#[derive(Debug, Default)]
pub struct ClientMemory {
    regions: HashMap<u64, Vec<u8>>,
}

impl ClientMemory {
    /// Create an empty handle with no registered buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `bytes` at `addr`, making them reachable by the server.
    pub fn register(&mut self, addr: u64, bytes: Vec<u8>) {
        self.regions.insert(addr, bytes);
    }

    /// Copy up to `len` bytes out of the buffer at `addr`.
    ///
    /// Shorter buffers yield a shorter copy, matching the kernel primitive's
    /// behavior of stopping at the end of the sender's mapped region.
    pub fn copy_from(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let region = self
            .regions
            .get(&addr)
            .ok_or(MemoryError::UnknownAddress(addr))?;
        let take = len.min(region.len());
        Ok(region[..take].to_vec())
    }

    /// Copy `bytes` into the start of the buffer at `addr`.
    pub fn copy_to(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let region = self
            .regions
            .get_mut(&addr)
            .ok_or(MemoryError::UnknownAddress(addr))?;
        if bytes.len() > region.len() {
            return Err(MemoryError::OutOfBounds {
                addr,
                len: bytes.len(),
                cap: region.len(),
            });
        }
        region[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reclaim the buffer at `addr` once the reply has arrived.
    pub fn take(&mut self, addr: u64) -> Option<Vec<u8>> {
        self.regions.remove(&addr)
    }
}

/// One in-flight request: the message, the sender's memory, and the slot the
/// reply is posted to.
#[derive(Debug)]
pub struct Envelope {
    /// The request message.
    pub msg: Message,
    /// The sender's registered buffers.
    pub mem: ClientMemory,
    /// Where the server posts the mutated message and memory.
    pub reply: oneshot::Sender<(Message, ClientMemory)>,
}

impl Envelope {
    /// Pair a request with a reply receiver.
    pub fn new(
        msg: Message,
        mem: ClientMemory,
    ) -> (Self, oneshot::Receiver<(Message, ClientMemory)>) {
        let (reply, rx) = oneshot::channel();
        (Envelope { msg, mem, reply }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_from_clamps_to_region() {
        let mut mem = ClientMemory::new();
        mem.register(1, b"abc".to_vec());
        assert_eq!(mem.copy_from(1, 100).unwrap(), b"abc");
        assert_eq!(mem.copy_from(1, 2).unwrap(), b"ab");
        assert!(matches!(
            mem.copy_from(2, 1),
            Err(MemoryError::UnknownAddress(2))
        ));
    }

    #[test]
    fn copy_to_rejects_overrun() {
        let mut mem = ClientMemory::new();
        mem.register(7, vec![0; 4]);
        mem.copy_to(7, b"hi").unwrap();
        assert_eq!(mem.take(7).unwrap(), b"hi\0\0");

        mem.register(7, vec![0; 1]);
        assert!(mem.copy_to(7, b"hi").is_err());
    }
}
