//! Push constant staging blocks.
//!
//! A [`PushConstantBlock`] is a host-side byte window that executors flush
//! with `vkCmdPushConstants` when a dispatch or draw record is encoded.
//! Sub-blocks alias the parent's storage at an offset, so a caller can hand
//! out disjoint regions of one block to independent writers.

use crate::error::RuntimeError;
use std::sync::{Arc, Mutex, MutexGuard};

struct PushStore {
    bytes: Mutex<Vec<u8>>,
}

/// A writable window into push constant storage.
#[derive(Clone)]
pub struct PushConstantBlock {
    store: Arc<PushStore>,
    offset: u32,
    len: u32,
}

impl PushConstantBlock {
    /// Allocates a zeroed block of `size` bytes.
    pub fn new(size: u32) -> Self {
        Self {
            store: Arc::new(PushStore {
                bytes: Mutex::new(vec![0; size as usize]),
            }),
            offset: 0,
            len: size,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this window within the root block.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    fn bytes(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.store.bytes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Writes `data` at `offset` within this window.
    pub fn write_bytes(&self, offset: u32, data: &[u8]) -> Result<(), RuntimeError> {
        let len = data.len() as u32;
        if offset.checked_add(len).is_none() || offset + len > self.len {
            return Err(RuntimeError::PushConstantOutOfBounds {
                offset,
                len,
                size: self.len,
            });
        }
        let mut bytes = self.bytes();
        let start = (self.offset + offset) as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Writes a plain-old-data value at `offset`.
    pub fn write<T: bytemuck::NoUninit>(&self, offset: u32, value: &T) -> Result<(), RuntimeError> {
        self.write_bytes(offset, bytemuck::bytes_of(value))
    }

    /// A sub-window of `len` bytes starting at `offset` within this window.
    ///
    /// The sub-block shares storage with its parent: writes through either
    /// are visible to both.
    pub fn sub_block(&self, offset: u32, len: u32) -> Result<PushConstantBlock, RuntimeError> {
        if offset.checked_add(len).is_none() || offset + len > self.len {
            return Err(RuntimeError::PushConstantOutOfBounds {
                offset,
                len,
                size: self.len,
            });
        }
        Ok(PushConstantBlock {
            store: self.store.clone(),
            offset: self.offset + offset,
            len,
        })
    }

    /// Snapshot of the window contents, as flushed at encode time.
    pub fn snapshot(&self) -> Vec<u8> {
        let bytes = self.bytes();
        bytes[self.offset as usize..(self.offset + self.len) as usize].to_vec()
    }
}
