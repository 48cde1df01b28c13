// SPDX-License-Identifier: GPL-3.0-only

//! Arena owning every live frame
//!
//! Lists and queues store [`FrameId`]s. Each holder accounts for itself with
//! [`FrameArena::retain`] / [`FrameArena::release`]; the arena deletes a frame
//! exactly once, when its owner count reaches zero and it is not locked.
//! A stale id (slot reused since) is rejected by generation check.

use super::{Frame, FrameId};
use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Lifetime counters of an arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaStats {
    pub created: u64,
    pub deleted: u64,
    pub live: usize,
    /// Frames deleted before every entity reached a terminal state
    pub forced: u64,
}

struct Entry {
    frame: Frame,
    owners: u32,
    locked: bool,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    stats: ArenaStats,
}

impl ArenaInner {
    fn entry(&self, id: FrameId) -> Result<&Entry> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(PipelineError::StaleFrame(id))
    }

    fn entry_mut(&mut self, id: FrameId) -> Result<&mut Entry> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(PipelineError::StaleFrame(id))
    }

    /// Remove the frame if nothing holds it any more
    fn reap(&mut self, id: FrameId) -> Option<Frame> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        let entry = slot.entry.as_ref()?;
        if entry.owners > 0 || entry.locked {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.stats.deleted += 1;
        self.stats.live -= 1;
        if !entry.frame.is_complete() {
            self.stats.forced += 1;
        }
        Some(entry.frame)
    }
}

/// Shared owner of all frames of a session
#[derive(Default)]
pub struct FrameArena {
    inner: Mutex<ArenaInner>,
}

impl FrameArena {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock_inner(&self) -> MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a frame; the caller holds the first ownership
    pub fn insert(&self, frame: Frame) -> FrameId {
        let mut inner = self.lock_inner();
        let fcount = frame.fcount();
        let entry = Entry {
            frame,
            owners: 1,
            locked: false,
        };
        let id = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.entry = Some(entry);
                FrameId::new(index, slot.generation)
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                FrameId::new(index, 0)
            }
        };
        inner.stats.created += 1;
        inner.stats.live += 1;
        trace!(%id, fcount, "Frame created");
        id
    }

    /// Add one ownership
    pub fn retain(&self, id: FrameId) -> Result<()> {
        self.lock_inner().entry_mut(id)?.owners += 1;
        Ok(())
    }

    /// Drop one ownership; returns `true` if this deleted the frame
    pub fn release(&self, id: FrameId) -> Result<bool> {
        let reaped = {
            let mut inner = self.lock_inner();
            let entry = inner.entry_mut(id)?;
            if entry.owners == 0 {
                return Err(PipelineError::FrameListCorruption {
                    list: "arena".to_string(),
                    frame: id,
                });
            }
            entry.owners -= 1;
            inner.reap(id)
        };
        Ok(self.dispose(id, reaped))
    }

    /// Pin a frame against deletion while it is inspected
    pub fn lock(&self, id: FrameId) -> Result<()> {
        self.lock_inner().entry_mut(id)?.locked = true;
        Ok(())
    }

    /// Unpin; deletes the frame if no owner remains
    pub fn unlock(&self, id: FrameId) -> Result<bool> {
        let reaped = {
            let mut inner = self.lock_inner();
            inner.entry_mut(id)?.locked = false;
            inner.reap(id)
        };
        Ok(self.dispose(id, reaped))
    }

    // Runs without the arena lock; buffer pools take their own
    fn dispose(&self, id: FrameId, frame: Option<Frame>) -> bool {
        let Some(mut frame) = frame else {
            return false;
        };
        let aborted = frame.abort();
        if aborted > 0 {
            warn!(%id, fcount = frame.fcount(), aborted, "Frame deleted before completion");
        }
        let released = frame.release_buffers();
        debug!(%id, fcount = frame.fcount(), released, "Frame deleted");
        true
    }

    /// Read access to a live frame
    pub fn with<R>(&self, id: FrameId, f: impl FnOnce(&Frame) -> R) -> Result<R> {
        let inner = self.lock_inner();
        Ok(f(&inner.entry(id)?.frame))
    }

    /// Write access to a live frame
    pub fn with_mut<R>(&self, id: FrameId, f: impl FnOnce(&mut Frame) -> R) -> Result<R> {
        let mut inner = self.lock_inner();
        Ok(f(&mut inner.entry_mut(id)?.frame))
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.lock_inner().entry(id).is_ok()
    }

    pub fn owners(&self, id: FrameId) -> Option<u32> {
        self.lock_inner().entry(id).ok().map(|e| e.owners)
    }

    pub fn is_locked(&self, id: FrameId) -> bool {
        self.lock_inner().entry(id).map(|e| e.locked).unwrap_or(false)
    }

    /// Ids of every live frame
    pub fn live_ids(&self) -> Vec<FrameId> {
        let inner = self.lock_inner();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| FrameId::new(index as u32, slot.generation))
            .collect()
    }

    pub fn live(&self) -> usize {
        self.lock_inner().stats.live
    }

    pub fn stats(&self) -> ArenaStats {
        self.lock_inner().stats
    }

    /// Delete every remaining frame regardless of owners
    ///
    /// Used once all workers have stopped. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let ids = self.live_ids();
        let mut purged = 0;
        for id in ids {
            let reaped = {
                let mut inner = self.lock_inner();
                match inner.entry_mut(id) {
                    Ok(entry) => {
                        entry.owners = 0;
                        entry.locked = false;
                    }
                    Err(_) => continue,
                }
                inner.reap(id)
            };
            if self.dispose(id, reaped) {
                purged += 1;
            }
        }
        if purged > 0 {
            warn!(purged, "Purged leftover frames");
        }
        purged
    }
}

impl std::fmt::Debug for FrameArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameArena")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Scoped pin on a frame
///
/// Holds one ownership plus the lock flag; both are dropped together.
pub struct LockedFrame {
    arena: Arc<FrameArena>,
    id: FrameId,
}

impl LockedFrame {
    pub fn new(arena: &Arc<FrameArena>, id: FrameId) -> Result<Self> {
        arena.retain(id)?;
        if let Err(e) = arena.lock(id) {
            if let Err(release) = arena.release(id) {
                warn!(%id, error = %release, "Could not undo retain of unlockable frame");
            }
            return Err(e);
        }
        Ok(Self {
            arena: Arc::clone(arena),
            id,
        })
    }

    /// Take over an ownership and lock the caller already holds
    pub(crate) fn adopt(arena: &Arc<FrameArena>, id: FrameId) -> Self {
        Self {
            arena: Arc::clone(arena),
            id,
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn with<R>(&self, f: impl FnOnce(&Frame) -> R) -> Result<R> {
        self.arena.with(self.id, f)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> Result<R> {
        self.arena.with_mut(self.id, f)
    }
}

impl Drop for LockedFrame {
    fn drop(&mut self) {
        let _ = self.arena.unlock(self.id);
        if let Err(e) = self.arena.release(self.id) {
            warn!(id = %self.id, error = %e, "Failed to release locked frame");
        }
    }
}

impl std::fmt::Debug for LockedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LockedFrame({})", self.id)
    }
}
