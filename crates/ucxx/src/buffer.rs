//! Shared byte regions handed to the transport.
//!
//! A [`Buffer`] stands in for the `(pointer, length)` pair the transport
//! reads from or writes into. Clones share the same storage, so the
//! application keeps a handle to a receive buffer while the transport fills
//! it from the progress thread.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

/// Shared byte region passed to send and receive operations.
///
/// Clones alias the same storage, so the transport can fill a receive
/// buffer the caller still holds.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl Buffer {
    /// Allocates a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from(vec![0u8; len])
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Writes `data` at `offset`; returns false if it would overrun.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let mut buf = self.lock();
        let end = match offset.checked_add(data.len()) {
            Some(end) => end,
            None => return false,
        };
        if end > buf.len() {
            return false;
        }
        buf[offset..end].copy_from_slice(data);
        true
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self::from(data.to_vec())
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Self::from(data.to_vec())
    }
}
