//! Serialised worker addresses.

use bytes::Bytes;

use crate::error::Result;
use crate::worker::Worker;

/// Opaque worker address exchanged out of band between peers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    bytes: Bytes,
}

impl Address {
    /// Address of a live worker.
    pub fn from_worker(worker: &Worker) -> Result<Self> {
        worker.address()
    }

    /// Wraps address bytes received out of band from a peer.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Serialised form to hand to a peer.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
