// SPDX-License-Identifier: GPL-3.0-only

//! Fixed-size pools of multi-plane hardware buffers
//!
//! A pool owns `max` slots. Each slot is either FREE (gettable) or checked
//! out in one of the in-flight states. The available count is always the
//! number of FREE slots.
//!
//! Every checkout stamps the slot with a fresh lease that the handle carries.
//! A handle whose lease no longer matches its slot cannot return or mark it.
//!
//! ```text
//!   get()          mark()            mark()
//! FREE ──▶ IN_HAL ──▶ REQUESTED ──▶ COMPLETE | ERROR
//!   ▲                                        │
//!   └────────────── put() / cancel() ────────┘
//! ```

use crate::backends::{AllocFlags, MemoryBackend, NativeBuffer};
use crate::constants::buffers::MAX_PLANES;
use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// State of one pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferState {
    Free,
    /// Checked out by the engine, not yet queued to a device
    InHal,
    /// Queued to a device
    Requested,
    Complete,
    Error,
}

/// When backing memory is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocMode {
    /// Every slot is backed during `alloc`
    #[default]
    AtOnce,
    /// `min` slots are backed during `alloc`, the rest on first `get`
    OnDemand,
}

/// Statistics about pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total slots in the pool
    pub capacity: usize,
    /// Slots with backing memory
    pub allocated: usize,
    /// FREE slots
    pub available: usize,
    pub in_use: usize,
    pub acquisitions: u64,
    /// `get` calls that found nothing FREE
    pub misses: u64,
    pub cancellations: u64,
}

struct Slot {
    state: BufferState,
    planes: Option<Vec<NativeBuffer>>,
    /// Lease of the current checkout; 0 while nobody holds a valid handle
    lease: u64,
}

#[derive(Default)]
struct PoolInner {
    slots: Vec<Slot>,
    plane_sizes: Vec<usize>,
    allocated: bool,
    generation: u64,
    /// Last lease handed out; never reused across alloc cycles
    last_lease: u64,
    acquisitions: u64,
    misses: u64,
    cancellations: u64,
}

impl PoolInner {
    fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == BufferState::Free)
            .count()
    }

    /// Slot `index` if `lease` is its current checkout
    fn leased_slot(&mut self, pool: &str, index: usize, lease: u64) -> Result<&mut Slot> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| PipelineError::InvalidBufferIndex {
                pool: pool.to_string(),
                index,
            })?;
        if slot.lease != lease {
            warn!(pool, index, lease, current = slot.lease, "Rejecting stale buffer handle");
            return Err(PipelineError::StaleBuffer {
                pool: pool.to_string(),
                index,
            });
        }
        Ok(slot)
    }
}

/// Pool of hardware-backed buffers for one stage role
pub struct BufferPool {
    name: String,
    memory: Arc<dyn MemoryBackend>,
    inner: Mutex<PoolInner>,
    injected_misses: AtomicU32,
}

impl BufferPool {
    pub fn new(name: &str, memory: Arc<dyn MemoryBackend>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            memory,
            inner: Mutex::new(PoolInner::default()),
            injected_misses: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_planes(&self, plane_sizes: &[usize]) -> Result<Vec<NativeBuffer>> {
        let mut planes = Vec::with_capacity(plane_sizes.len());
        for (i, &size) in plane_sizes.iter().enumerate() {
            // Last plane carries shot metadata
            let flags = AllocFlags {
                cached: i + 1 == plane_sizes.len(),
                reserved: false,
            };
            match self.memory.allocate(size, flags) {
                Ok(plane) => planes.push(plane),
                Err(e) => {
                    self.free_planes(planes);
                    return Err(PipelineError::Allocation {
                        pool: self.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(planes)
    }

    fn free_planes(&self, planes: Vec<NativeBuffer>) {
        for plane in planes {
            if let Err(e) = self.memory.free(plane) {
                warn!(pool = %self.name, fd = plane.fd, error = %e, "Failed to free plane");
            }
        }
    }

    // ===== Lifecycle =====

    /// Reserve `max` slots with the given plane layout
    ///
    /// With [`AllocMode::AtOnce`] every slot is backed now; with
    /// [`AllocMode::OnDemand`] only `min` are, the rest on first use.
    /// Partially obtained memory is released before an error is returned.
    pub fn alloc(
        &self,
        plane_sizes: &[usize],
        min_count: usize,
        max_count: usize,
        mode: AllocMode,
    ) -> Result<()> {
        if plane_sizes.is_empty() || plane_sizes.len() > MAX_PLANES {
            return Err(PipelineError::Config(format!(
                "pool {}: plane count {} outside 1..={}",
                self.name,
                plane_sizes.len(),
                MAX_PLANES
            )));
        }
        if max_count == 0 || min_count > max_count {
            return Err(PipelineError::Config(format!(
                "pool {}: invalid buffer count contract min={} max={}",
                self.name, min_count, max_count
            )));
        }

        let mut inner = self.lock();
        if inner.allocated {
            return Err(PipelineError::PoolAlreadyAllocated(self.name.clone()));
        }

        let backed = match mode {
            AllocMode::AtOnce => max_count,
            AllocMode::OnDemand => min_count,
        };

        let mut slots: Vec<Slot> = Vec::with_capacity(max_count);
        for index in 0..max_count {
            let planes = if index < backed {
                match self.allocate_planes(plane_sizes) {
                    Ok(planes) => Some(planes),
                    Err(e) => {
                        for slot in slots.drain(..) {
                            if let Some(planes) = slot.planes {
                                self.free_planes(planes);
                            }
                        }
                        warn!(pool = %self.name, index, error = %e, "Pool allocation failed");
                        return Err(e);
                    }
                }
            } else {
                None
            };
            slots.push(Slot {
                state: BufferState::Free,
                planes,
                lease: 0,
            });
        }

        inner.slots = slots;
        inner.plane_sizes = plane_sizes.to_vec();
        inner.allocated = true;
        inner.generation += 1;

        info!(
            pool = %self.name,
            planes = plane_sizes.len(),
            min = min_count,
            max = max_count,
            mode = ?mode,
            "Buffer pool allocated"
        );
        Ok(())
    }

    /// Return every slot to FREE regardless of who holds it
    ///
    /// Handles still out are invalidated. Returns how many slots were
    /// reclaimed.
    pub fn reset(&self) -> usize {
        let mut inner = self.lock();
        let mut reclaimed = 0;
        for slot in inner.slots.iter_mut() {
            if slot.state != BufferState::Free {
                slot.state = BufferState::Free;
                reclaimed += 1;
            }
            slot.lease = 0;
        }
        if reclaimed > 0 {
            inner.generation += 1;
            warn!(pool = %self.name, reclaimed, "Reset reclaimed checked-out buffers");
        }
        reclaimed
    }

    /// Free all backing memory
    ///
    /// Refused while buffers are checked out. A no-op on an unallocated pool.
    pub fn deinit(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.allocated {
            return Ok(());
        }
        let in_use = inner.slots.len() - inner.free_count();
        if in_use > 0 {
            return Err(PipelineError::PoolInUse {
                pool: self.name.clone(),
                in_use,
            });
        }

        let slots = std::mem::take(&mut inner.slots);
        inner.allocated = false;
        inner.plane_sizes.clear();
        inner.generation += 1;
        drop(inner);

        for slot in slots {
            if let Some(planes) = slot.planes {
                self.free_planes(planes);
            }
        }
        info!(pool = %self.name, "Buffer pool released");
        Ok(())
    }

    // ===== Checkout =====

    /// Check out a FREE buffer
    ///
    /// Fails with `NoBufferAvailable` when nothing is FREE. Never blocks.
    pub fn get(self: &Arc<Self>) -> Result<BufferHandle> {
        if self
            .injected_misses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.lock().misses += 1;
            debug!(pool = %self.name, "Injected buffer exhaustion");
            return Err(PipelineError::NoBufferAvailable {
                pool: self.name.clone(),
            });
        }

        let mut inner = self.lock();
        if !inner.allocated {
            return Err(PipelineError::PoolNotAllocated(self.name.clone()));
        }

        let backed = inner
            .slots
            .iter()
            .position(|s| s.state == BufferState::Free && s.planes.is_some());
        let index = match backed {
            Some(index) => index,
            None => {
                let Some(index) = inner
                    .slots
                    .iter()
                    .position(|s| s.state == BufferState::Free)
                else {
                    inner.misses += 1;
                    return Err(PipelineError::NoBufferAvailable {
                        pool: self.name.clone(),
                    });
                };
                let plane_sizes = inner.plane_sizes.clone();
                let planes = self.allocate_planes(&plane_sizes)?;
                debug!(pool = %self.name, index, "Backed on-demand slot");
                inner.slots[index].planes = Some(planes);
                index
            }
        };

        inner.last_lease += 1;
        let lease = inner.last_lease;
        let slot = &mut inner.slots[index];
        slot.state = BufferState::InHal;
        slot.lease = lease;
        let planes = slot.planes.clone().unwrap_or_default();
        inner.acquisitions += 1;

        Ok(BufferHandle {
            pool: Arc::clone(self),
            index,
            lease,
            planes,
        })
    }

    /// Return a leased buffer to FREE
    ///
    /// Returns `false` if it was already FREE; nothing is double-counted.
    fn release(&self, index: usize, lease: u64, cancelled: bool) -> Result<bool> {
        let mut inner = self.lock();
        let slot = inner.leased_slot(&self.name, index, lease)?;
        if slot.state == BufferState::Free {
            debug!(pool = %self.name, index, "Buffer already free");
            return Ok(false);
        }
        slot.state = BufferState::Free;
        if cancelled {
            inner.cancellations += 1;
        }
        Ok(true)
    }

    /// Move a leased buffer to an in-flight state
    fn mark(&self, index: usize, lease: u64, state: BufferState) -> Result<()> {
        let mut inner = self.lock();
        let slot = inner.leased_slot(&self.name, index, lease)?;
        if slot.state == BufferState::Free || state == BufferState::Free {
            warn!(pool = %self.name, index, from = ?slot.state, to = ?state, "Ignoring mark");
            return Ok(());
        }
        slot.state = state;
        Ok(())
    }

    /// Make the next `count` calls to `get` fail with `NoBufferAvailable`
    pub fn inject_exhaustion(&self, count: u32) {
        self.injected_misses.fetch_add(count, Ordering::SeqCst);
    }

    // ===== Inspection =====

    pub fn state(&self, index: usize) -> Option<BufferState> {
        self.lock().slots.get(index).map(|s| s.state)
    }

    /// Number of FREE buffers
    pub fn available(&self) -> usize {
        self.lock().free_count()
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_allocated(&self) -> bool {
        self.lock().allocated
    }

    /// Incremented on every alloc, deinit and reclaiming reset
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn plane_sizes(&self) -> Vec<usize> {
        self.lock().plane_sizes.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let available = inner.free_count();
        PoolStats {
            capacity: inner.slots.len(),
            allocated: inner.slots.iter().filter(|s| s.planes.is_some()).count(),
            available,
            in_use: inner.slots.len() - available,
            acquisitions: inner.acquisitions,
            misses: inner.misses,
            cancellations: inner.cancellations,
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        let slots = std::mem::take(&mut inner.slots);
        for slot in slots {
            if let Some(planes) = slot.planes {
                for plane in planes {
                    if let Err(e) = self.memory.free(plane) {
                        warn!(pool = %self.name, fd = plane.fd, error = %e, "Failed to free plane on drop");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// BufferHandle
// ============================================================================

/// A checked-out buffer
///
/// Identity is pool plus index plus lease. Handles are cheap to clone;
/// exactly one owner is expected to call [`put`](Self::put) or
/// [`cancel`](Self::cancel). Once the slot is reset or checked out again
/// every clone is stale.
#[derive(Clone)]
pub struct BufferHandle {
    pool: Arc<BufferPool>,
    index: usize,
    lease: u64,
    planes: Vec<NativeBuffer>,
}

impl BufferHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub fn planes(&self) -> &[NativeBuffer] {
        &self.planes
    }

    /// Total bytes across all planes
    pub fn size(&self) -> usize {
        self.planes.iter().map(|p| p.size).sum()
    }

    pub fn lease(&self) -> u64 {
        self.lease
    }

    /// The slot is still checked out under this handle's lease
    pub fn is_current(&self) -> bool {
        self.pool
            .lock()
            .slots
            .get(self.index)
            .is_some_and(|slot| slot.lease == self.lease && slot.state != BufferState::Free)
    }

    pub fn mark(&self, state: BufferState) -> Result<()> {
        self.pool.mark(self.index, self.lease, state)
    }

    pub fn put(self) -> Result<bool> {
        self.pool.release(self.index, self.lease, false)
    }

    /// Return a buffer whose capture attempt produced no usable data
    pub fn cancel(self) -> Result<bool> {
        self.pool.release(self.index, self.lease, true)
    }

    /// Both handles refer to the same pool slot
    pub fn same_buffer(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool) && self.index == other.index
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferHandle({}[{}]#{})", self.pool.name(), self.index, self.lease)
    }
}

/// Scoped checkout that cancels the buffer unless committed
///
/// Every early return between `get()` and the point where ownership is
/// handed to a frame gives the buffer back.
pub struct BufferGuard {
    handle: Option<BufferHandle>,
}

impl BufferGuard {
    pub fn new(handle: BufferHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn index(&self) -> usize {
        self.handle.as_ref().map(|h| h.index).unwrap_or_default()
    }

    /// Keep the buffer checked out and hand it on
    pub fn commit(mut self) -> Option<BufferHandle> {
        self.handle.take()
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(pool = %handle.pool_name(), index = handle.index, "Uncommitted buffer cancelled");
            let pool = handle.pool_name().to_string();
            if let Err(e) = handle.cancel() {
                warn!(pool = %pool, error = %e, "Uncommitted buffer could not be returned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::HeapMemory;

    fn pool(count: usize) -> Arc<BufferPool> {
        let pool = BufferPool::new("test", Arc::new(HeapMemory::new()));
        pool.alloc(&[256, 128], count, count, AllocMode::AtOnce)
            .unwrap();
        pool
    }

    #[test]
    fn test_get_until_exhausted() {
        let pool = pool(3);
        let handles: Vec<_> = (0..3).map(|_| pool.get().unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert!(matches!(
            pool.get(),
            Err(PipelineError::NoBufferAvailable { .. })
        ));
        assert_eq!(pool.stats().misses, 1);

        for handle in handles {
            assert!(handle.put().unwrap());
        }
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_double_cancel_is_noop() {
        let pool = pool(2);
        let handle = pool.get().unwrap();
        let again = handle.clone();
        assert!(handle.cancel().unwrap());
        assert!(!again.cancel().unwrap());
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.stats().cancellations, 1);
    }

    #[test]
    fn test_stale_handle_cannot_free_reused_slot() {
        let pool = pool(1);
        let first = pool.get().unwrap();
        let stale = first.clone();
        assert!(first.put().unwrap());

        let second = pool.get().unwrap();
        assert!(second.same_buffer(&stale));
        assert_ne!(second.lease(), stale.lease());
        assert!(!stale.is_current());
        assert!(matches!(
            stale.mark(BufferState::Requested),
            Err(PipelineError::StaleBuffer { index: 0, .. })
        ));
        assert!(matches!(
            stale.put(),
            Err(PipelineError::StaleBuffer { index: 0, .. })
        ));
        assert_eq!(pool.state(0), Some(BufferState::InHal));
        assert_eq!(pool.available(), 0);

        assert!(second.is_current());
        assert!(second.put().unwrap());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_reset_invalidates_outstanding_handles() {
        let pool = pool(2);
        let before = pool.get().unwrap();
        let generation = pool.generation();
        assert_eq!(pool.reset(), 1);
        assert!(pool.generation() > generation);

        let after = pool.get().unwrap();
        assert!(matches!(before.cancel(), Err(PipelineError::StaleBuffer { .. })));
        assert_eq!(pool.stats().cancellations, 0);
        assert_eq!(pool.available(), 1);
        after.put().unwrap();
    }

    #[test]
    fn test_handle_from_a_previous_allocation() {
        let pool = pool(3);
        let old = pool.get().unwrap();
        let _middle = pool.get().unwrap();
        let last = pool.get().unwrap();
        pool.reset();
        pool.deinit().unwrap();
        pool.alloc(&[64], 1, 1, AllocMode::AtOnce).unwrap();

        let fresh = pool.get().unwrap();
        assert!(fresh.same_buffer(&old));
        assert!(matches!(old.put(), Err(PipelineError::StaleBuffer { .. })));
        assert!(matches!(
            last.put(),
            Err(PipelineError::InvalidBufferIndex { index: 2, .. })
        ));
        assert!(fresh.put().unwrap());
    }

    #[test]
    fn test_mark_states() {
        let pool = pool(1);
        let handle = pool.get().unwrap();
        assert_eq!(pool.state(0), Some(BufferState::InHal));
        handle.mark(BufferState::Requested).unwrap();
        handle.mark(BufferState::Complete).unwrap();
        assert_eq!(pool.state(0), Some(BufferState::Complete));
        handle.put().unwrap();
        assert_eq!(pool.state(0), Some(BufferState::Free));
    }

    #[test]
    fn test_on_demand_backs_lazily() {
        let memory = Arc::new(HeapMemory::new());
        let pool = BufferPool::new("lazy", memory.clone());
        pool.alloc(&[64], 1, 4, AllocMode::OnDemand).unwrap();
        assert_eq!(memory.live_allocations(), 1);
        assert_eq!(pool.available(), 4);

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(memory.live_allocations(), 2);
        assert_eq!(pool.stats().allocated, 2);
        a.put().unwrap();
        b.put().unwrap();
    }

    #[test]
    fn test_alloc_failure_releases_memory() {
        let memory = Arc::new(HeapMemory::with_limit(1000));
        let pool = BufferPool::new("small", memory.clone());
        let result = pool.alloc(&[400], 4, 4, AllocMode::AtOnce);
        assert!(matches!(result, Err(PipelineError::Allocation { .. })));
        assert_eq!(memory.live_allocations(), 0);
        assert!(!pool.is_allocated());
    }

    #[test]
    fn test_deinit_refused_while_in_use() {
        let pool = pool(2);
        let handle = pool.get().unwrap();
        assert!(matches!(
            pool.deinit(),
            Err(PipelineError::PoolInUse { in_use: 1, .. })
        ));
        handle.put().unwrap();
        let generation = pool.generation();
        pool.deinit().unwrap();
        assert!(pool.generation() > generation);
        assert_eq!(pool.capacity(), 0);
    }

    #[test]
    fn test_reset_reclaims() {
        let pool = pool(3);
        let _a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        assert_eq!(pool.reset(), 2);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_injected_exhaustion() {
        let pool = pool(2);
        pool.inject_exhaustion(2);
        assert!(pool.get().is_err());
        assert!(pool.get().is_err());
        assert!(pool.get().is_ok());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_guard_cancels_uncommitted() {
        let pool = pool(1);
        {
            let _guard = BufferGuard::new(pool.get().unwrap());
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);

        let guard = BufferGuard::new(pool.get().unwrap());
        let handle = guard.commit().unwrap();
        assert_eq!(pool.available(), 0);
        handle.put().unwrap();
    }

    #[test]
    fn test_realloc_requires_deinit() {
        let pool = pool(1);
        assert!(matches!(
            pool.alloc(&[16], 1, 1, AllocMode::AtOnce),
            Err(PipelineError::PoolAlreadyAllocated(_))
        ));
    }
}
