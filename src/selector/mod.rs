// SPDX-License-Identifier: GPL-3.0-only

//! Capture selector
//!
//! Keeps bounded hold lists of recently completed frames, one per
//! (stage, direction), and hands one out to a still capture on request.
//!
//! ```text
//!  frame-done ──manage_frame_hold_list──▶ [ f7 f8 f9 ] (cap = hold count)
//!                                            │   evicted frames are released
//!  picture worker ◀──select_frames(policy)───┘
//! ```
//!
//! The hold list owns one arena reference per entry. Selection moves that
//! reference into a [`SelectedFrame`]; eviction and clearing release it.

pub mod policy;

pub use policy::{CaptureIntent, Choice, HeldInfo, SelectionPolicy};

use crate::buffers::BufferHandle;
use crate::config::TimingConfig;
use crate::errors::{PipelineError, Result};
use crate::frame::{EntityState, Frame, FrameArena, FrameId, LockedFrame};
use crate::pipes::PipeId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Hold lists are keyed by stage and buffer direction
type HoldKey = (PipeId, bool);

#[derive(Debug, Clone, Copy)]
struct Held {
    id: FrameId,
    info: HeldInfo,
}

/// Selector counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorStats {
    pub inserted: u64,
    pub evicted: u64,
    pub selected: u64,
    /// Selections that fell back to the oldest frame
    pub fallbacks: u64,
    pub timeouts: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct SelectorInner {
    lists: HashMap<HoldKey, VecDeque<Held>>,
    policy: Option<SelectionPolicy>,
    /// Bumped by `cancel_picture` so waiting selections give up
    cancel_epoch: u64,
    stats: SelectorStats,
}

/// Hold lists plus the active selection policy
pub struct CaptureSelector {
    arena: Arc<FrameArena>,
    capacity: usize,
    timing: TimingConfig,
    inner: Mutex<SelectorInner>,
    arrived: Condvar,
}

impl CaptureSelector {
    pub fn new(arena: Arc<FrameArena>, capacity: usize, timing: TimingConfig) -> Self {
        Self {
            arena,
            capacity: capacity.max(1),
            timing,
            inner: Mutex::new(SelectorInner::default()),
            arrived: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SelectorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Policy used by following selections; `None` means oldest-first
    pub fn set_policy(&self, policy: Option<SelectionPolicy>) {
        self.lock().policy = policy;
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.lock().policy.unwrap_or(SelectionPolicy::Oldest)
    }

    /// Take over the caller's reference to `id` and hold it
    ///
    /// The frame's entity for `pipe` must be COMPLETE; otherwise the frame
    /// is released instead and `Ok(false)` is returned. The oldest entry is
    /// evicted when the list is full. A frame already held on any list is
    /// refused with `FrameListCorruption` and the caller keeps its reference.
    pub fn manage_frame_hold_list(&self, id: FrameId, pipe: PipeId, is_source: bool) -> Result<bool> {
        let info = self.arena.with(id, |frame| hold_info(frame, pipe, is_source));
        let info = match info {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!(%id, pipe = %pipe, "Frame not holdable, releasing");
                self.arena.release(id)?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let evicted: Vec<FrameId> = {
            let mut inner = self.lock();
            if inner.lists.values().flatten().any(|held| held.id == id) {
                return Err(PipelineError::FrameListCorruption {
                    list: "hold".to_string(),
                    frame: id,
                });
            }
            let list = inner.lists.entry((pipe, is_source)).or_default();
            list.push_back(Held { id, info });
            let mut evicted = Vec::new();
            while list.len() > self.capacity {
                if let Some(old) = list.pop_front() {
                    evicted.push(old.id);
                }
            }
            inner.stats.inserted += 1;
            inner.stats.evicted += evicted.len() as u64;
            evicted
        };
        self.arrived.notify_all();
        trace!(fcount = info.fcount, pipe = %pipe, evicted = evicted.len(), "Frame held");
        self.release_all(&evicted, "hold-list eviction");
        Ok(true)
    }

    /// Remove and return a frame according to the active policy
    ///
    /// `count` is the shot index within the current capture sequence.
    /// Polls up to `retry_count` times; after that the oldest held frame is
    /// taken if there is one, else `SelectionTimeout` is returned.
    /// `cancel_picture` from another thread ends the wait with
    /// `CaptureCancelled`.
    pub fn select_frames(
        &self,
        count: u32,
        pipe: PipeId,
        is_source: bool,
        retry_count: u32,
    ) -> Result<SelectedFrame> {
        let deadline = Instant::now() + self.timing.selector_hold_wait();
        let mut inner = self.lock();
        let epoch = inner.cancel_epoch;
        let policy = inner.policy.unwrap_or(SelectionPolicy::Oldest);
        let interval = policy.poll_interval(&self.timing);
        let mut attempts = 0u32;

        loop {
            if inner.cancel_epoch != epoch {
                inner.stats.cancelled += 1;
                return Err(PipelineError::CaptureCancelled);
            }

            let list = inner.lists.entry((pipe, is_source)).or_default();
            let infos: Vec<HeldInfo> = list.iter().map(|h| h.info).collect();
            let Choice { stale, pick } = policy.choose(&infos, count);
            let exhausted = attempts >= retry_count || Instant::now() >= deadline;

            let mut dropped = Vec::new();
            let taken = match pick {
                Some(_) => {
                    dropped.extend(list.drain(..stale).map(|h| h.id));
                    list.pop_front()
                }
                // Stale frames stay held while they can still serve as a fallback
                None if exhausted => list.pop_front(),
                None => None,
            };
            let fell_back = pick.is_none() && taken.is_some();

            if !dropped.is_empty() || taken.is_some() {
                inner.stats.evicted += dropped.len() as u64;
                if taken.is_some() {
                    inner.stats.selected += 1;
                }
                if fell_back {
                    inner.stats.fallbacks += 1;
                }
            }

            if let Some(held) = taken {
                drop(inner);
                self.release_all(&dropped, "selection");
                if fell_back {
                    info!(policy = %policy, fcount = held.info.fcount, "No frame matched, using oldest");
                }
                return self.adopt(held, pipe, is_source);
            }

            if exhausted {
                inner.stats.timeouts += 1;
                drop(inner);
                warn!(pipe = %pipe, attempts, policy = %policy, "Frame selection timed out");
                return Err(PipelineError::SelectionTimeout { pipe, attempts });
            }

            attempts += 1;
            inner = match self.arrived.wait_timeout(inner, interval) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn adopt(&self, held: Held, pipe: PipeId, is_source: bool) -> Result<SelectedFrame> {
        // The hold-list reference moves into the guard
        self.arena.lock(held.id)?;
        debug!(fcount = held.info.fcount, pipe = %pipe, "Frame selected");
        Ok(SelectedFrame {
            frame: LockedFrame::adopt(&self.arena, held.id),
            fcount: held.info.fcount,
            pipe,
            is_source,
        })
    }

    /// Drop every held frame and wake waiting selections
    pub fn cancel_picture(&self) -> usize {
        let dropped = {
            let mut inner = self.lock();
            inner.cancel_epoch += 1;
            drain_lists(&mut inner)
        };
        self.arrived.notify_all();
        let count = dropped.len();
        self.release_all(&dropped, "cancel");
        if count > 0 {
            info!(frames = count, "Picture cancelled, hold lists cleared");
        }
        count
    }

    /// Release every held frame; returns how many were dropped
    pub fn clear_list(&self) -> usize {
        let dropped = drain_lists(&mut self.lock());
        self.arrived.notify_all();
        self.release_all(&dropped, "clear");
        dropped.len()
    }

    pub fn held(&self, pipe: PipeId, is_source: bool) -> Vec<FrameId> {
        self.lock()
            .lists
            .get(&(pipe, is_source))
            .map(|list| list.iter().map(|h| h.id).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().lists.values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SelectorStats {
        self.lock().stats
    }

    fn release_all(&self, ids: &[FrameId], reason: &str) {
        for &id in ids {
            if let Err(e) = self.arena.release(id) {
                warn!(%id, reason, error = %e, "Held frame already gone");
            }
        }
    }
}

impl std::fmt::Debug for CaptureSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSelector")
            .field("capacity", &self.capacity)
            .field("held", &self.len())
            .finish()
    }
}

fn drain_lists(inner: &mut SelectorInner) -> Vec<FrameId> {
    inner
        .lists
        .values_mut()
        .flat_map(|list| list.drain(..).map(|h| h.id))
        .collect()
}

fn hold_info(frame: &Frame, pipe: PipeId, is_source: bool) -> Option<HeldInfo> {
    let entity = frame.entity(pipe)?;
    if entity.state() != EntityState::Complete {
        return None;
    }
    let slot = if is_source { &entity.src } else { &entity.dst };
    slot.handle()?;
    Some(HeldInfo {
        fcount: frame.fcount(),
        af: frame.meta.af,
    })
}

/// A frame taken off a hold list
///
/// Pinned in the arena until dropped; dropping releases the hold-list
/// reference and returns whatever buffers the frame still owns.
pub struct SelectedFrame {
    frame: LockedFrame,
    fcount: u32,
    pipe: PipeId,
    is_source: bool,
}

impl SelectedFrame {
    pub fn id(&self) -> FrameId {
        self.frame.id()
    }

    pub fn fcount(&self) -> u32 {
        self.fcount
    }

    /// Move the held buffer out of the frame
    pub fn take_buffer(&self) -> Option<BufferHandle> {
        self.frame
            .with_mut(|frame| frame.take_buffer(self.pipe, self.is_source))
            .ok()
            .flatten()
    }

    pub fn with<R>(&self, f: impl FnOnce(&Frame) -> R) -> Result<R> {
        self.frame.with(f)
    }
}

impl std::fmt::Debug for SelectedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedFrame")
            .field("fcount", &self.fcount)
            .field("pipe", &self.pipe)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::HeapMemory;
    use crate::buffers::{AllocMode, BufferPool};
    use crate::frame::FrameKind;
    use std::time::Duration;

    fn held_frame(arena: &FrameArena, pool: &Arc<BufferPool>, fcount: u32) -> FrameId {
        let mut frame = Frame::new(fcount, fcount as u64, FrameKind::Preview, &[PipeId::Flite]);
        let entity = frame.entity_mut(PipeId::Flite).unwrap();
        entity.dst.attach_owned(pool.get().unwrap());
        entity.transition(EntityState::Processing).unwrap();
        entity.transition(EntityState::Complete).unwrap();
        arena.insert(frame)
    }

    fn setup(buffers: usize) -> (Arc<FrameArena>, Arc<BufferPool>) {
        let pool = BufferPool::new("sensor", Arc::new(HeapMemory::new()));
        pool.alloc(&[64], buffers, buffers, AllocMode::AtOnce).unwrap();
        (FrameArena::new(), pool)
    }

    fn fast_timing() -> TimingConfig {
        TimingConfig {
            waiting_time_ms: 1,
            dm_waiting_time_ms: 1,
            ..TimingConfig::default()
        }
    }

    #[test]
    fn test_eviction_returns_buffers() {
        let (arena, pool) = setup(4);
        let selector = CaptureSelector::new(arena.clone(), 2, fast_timing());
        for fcount in 1..=4 {
            let id = held_frame(&arena, &pool, fcount);
            assert!(selector.manage_frame_hold_list(id, PipeId::Flite, false).unwrap());
        }
        assert_eq!(selector.len(), 2);
        assert_eq!(pool.available(), 2);
        assert_eq!(selector.stats().evicted, 2);
    }

    #[test]
    fn test_frame_is_held_at_most_once() {
        let (arena, pool) = setup(2);
        let selector = CaptureSelector::new(arena.clone(), 4, fast_timing());
        let id = held_frame(&arena, &pool, 1);
        assert!(selector.manage_frame_hold_list(id, PipeId::Flite, false).unwrap());

        // A second hand-over is refused and the caller keeps its reference
        arena.retain(id).unwrap();
        assert!(matches!(
            selector.manage_frame_hold_list(id, PipeId::Flite, false),
            Err(PipelineError::FrameListCorruption { frame, .. }) if frame == id
        ));
        assert_eq!(selector.held(PipeId::Flite, false), vec![id]);
        assert_eq!(selector.stats().inserted, 1);
        assert_eq!(arena.owners(id), Some(2));

        arena.release(id).unwrap();
        assert_eq!(selector.clear_list(), 1);
        assert!(!arena.contains(id));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_incomplete_frame_not_held() {
        let (arena, _) = setup(1);
        let selector = CaptureSelector::new(arena.clone(), 2, fast_timing());
        let id = arena.insert(Frame::new(1, 1, FrameKind::Preview, &[PipeId::Flite]));
        arena.with_mut(id, |f| f.abort()).unwrap();
        assert!(!selector.manage_frame_hold_list(id, PipeId::Flite, false).unwrap());
        assert!(selector.is_empty());
        assert!(!arena.contains(id));
    }

    #[test]
    fn test_select_oldest_and_release() {
        let (arena, pool) = setup(3);
        let selector = CaptureSelector::new(arena.clone(), 3, fast_timing());
        for fcount in [5, 6, 7] {
            let id = held_frame(&arena, &pool, fcount);
            selector.manage_frame_hold_list(id, PipeId::Flite, false).unwrap();
        }
        let selected = selector.select_frames(0, PipeId::Flite, false, 3).unwrap();
        assert_eq!(selected.fcount(), 5);
        let buffer = selected.take_buffer().unwrap();
        drop(selected);
        assert_eq!(pool.available(), 0);
        buffer.put().unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(arena.live(), 2);
    }

    #[test]
    fn test_policy_evicts_older_frames() {
        let (arena, pool) = setup(4);
        let selector = CaptureSelector::new(arena.clone(), 4, fast_timing());
        for fcount in [1, 2, 3, 4] {
            let id = held_frame(&arena, &pool, fcount);
            selector.manage_frame_hold_list(id, PipeId::Flite, false).unwrap();
        }
        selector.set_policy(Some(SelectionPolicy::AfterFcount { fcount: 2 }));
        let selected = selector.select_frames(0, PipeId::Flite, false, 3).unwrap();
        assert_eq!(selected.fcount(), 3);
        assert_eq!(selector.held(PipeId::Flite, false).len(), 1);
        drop(selected);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_empty_list_times_out() {
        let (arena, _) = setup(1);
        let selector = CaptureSelector::new(arena, 2, fast_timing());
        let result = selector.select_frames(0, PipeId::Flite, false, 3);
        assert!(matches!(
            result,
            Err(PipelineError::SelectionTimeout { attempts: 3, .. })
        ));
        assert_eq!(selector.stats().timeouts, 1);
    }

    #[test]
    fn test_unmatched_policy_falls_back_to_oldest() {
        let (arena, pool) = setup(2);
        let selector = CaptureSelector::new(arena.clone(), 2, fast_timing());
        let id = held_frame(&arena, &pool, 3);
        selector.manage_frame_hold_list(id, PipeId::Flite, false).unwrap();
        selector.set_policy(Some(SelectionPolicy::Flash { fcount: 100 }));
        let selected = selector.select_frames(0, PipeId::Flite, false, 2).unwrap();
        assert_eq!(selected.fcount(), 3);
        assert_eq!(selector.stats().fallbacks, 1);
    }

    #[test]
    fn test_waiting_selection_sees_new_frame() {
        let (arena, pool) = setup(2);
        let selector = Arc::new(CaptureSelector::new(
            arena.clone(),
            2,
            TimingConfig {
                waiting_time_ms: 20,
                ..TimingConfig::default()
            },
        ));
        let waiter = {
            let selector = Arc::clone(&selector);
            std::thread::spawn(move || {
                selector
                    .select_frames(0, PipeId::Flite, false, 50)
                    .map(|s| s.fcount())
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        let id = held_frame(&arena, &pool, 9);
        selector.manage_frame_hold_list(id, PipeId::Flite, false).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), 9);
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let (arena, pool) = setup(2);
        let selector = Arc::new(CaptureSelector::new(
            arena.clone(),
            2,
            TimingConfig {
                waiting_time_ms: 20,
                ..TimingConfig::default()
            },
        ));
        let id = held_frame(&arena, &pool, 1);
        selector.manage_frame_hold_list(id, PipeId::Flite, false).unwrap();
        selector.set_policy(Some(SelectionPolicy::Flash { fcount: 1000 }));
        let waiter = {
            let selector = Arc::clone(&selector);
            std::thread::spawn(move || selector.select_frames(0, PipeId::Flite, false, 50).map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(30));
        selector.cancel_picture();
        assert!(matches!(waiter.join().unwrap(), Err(PipelineError::CaptureCancelled)));
        assert_eq!(pool.available(), 2);
    }
}
