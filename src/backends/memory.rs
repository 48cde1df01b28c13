// SPDX-License-Identifier: GPL-3.0-only

//! Native buffer allocation
//!
//! [`HeapMemory`] backs planes with heap allocations and hands out fake file
//! descriptors so the rest of the engine can treat them like dma-buf planes.

use super::types::{BackendError, BackendResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, warn};

/// Allocation hints forwarded to the memory backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags {
    /// CPU-cached mapping (metadata planes)
    pub cached: bool,
    /// Carve-out memory reserved at boot
    pub reserved: bool,
}

/// One natively allocated plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBuffer {
    pub fd: i32,
    pub addr: usize,
    pub size: usize,
}

/// Memory allocator consumed by buffer pools
pub trait MemoryBackend: Send + Sync {
    fn allocate(&self, size: usize, flags: AllocFlags) -> BackendResult<NativeBuffer>;
    fn free(&self, buffer: NativeBuffer) -> BackendResult<()>;
}

/// Heap-backed memory backend
///
/// An optional byte limit simulates a carve-out running dry.
pub struct HeapMemory {
    blocks: Mutex<HashMap<i32, Box<[u8]>>>,
    next_fd: AtomicI32,
    limit: Option<usize>,
}

impl HeapMemory {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(100),
            limit: None,
        }
    }

    /// Fail allocations once `limit` bytes are outstanding
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Bytes currently allocated
    pub fn allocated_bytes(&self) -> usize {
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        blocks.values().map(|b| b.len()).sum()
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for HeapMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for HeapMemory {
    fn allocate(&self, size: usize, flags: AllocFlags) -> BackendResult<NativeBuffer> {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(limit) = self.limit {
            let used: usize = blocks.values().map(|b| b.len()).sum();
            if used + size > limit {
                warn!(size, used, limit, "Heap memory limit reached");
                return Err(BackendError::OutOfMemory(format!(
                    "{} bytes requested, {} of {} in use",
                    size, used, limit
                )));
            }
        }

        let block = vec![0u8; size].into_boxed_slice();
        let addr = block.as_ptr() as usize;
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        blocks.insert(fd, block);

        debug!(fd, size, cached = flags.cached, "Allocated plane");
        Ok(NativeBuffer { fd, addr, size })
    }

    fn free(&self, buffer: NativeBuffer) -> BackendResult<()> {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        match blocks.remove(&buffer.fd) {
            Some(_) => Ok(()),
            None => Err(BackendError::InvalidHandle(format!("fd {}", buffer.fd))),
        }
    }
}
