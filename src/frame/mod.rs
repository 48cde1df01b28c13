// SPDX-License-Identifier: GPL-3.0-only

//! Capture frames and their per-stage entities
//!
//! A frame is created for one capture request and walks its route of
//! entities strictly forward. Frames live in a [`FrameArena`]; every list or
//! queue refers to them by [`FrameId`].

pub mod arena;
pub mod entity;

pub use arena::{ArenaStats, FrameArena, LockedFrame};
pub use entity::{BufferSlot, Entity, EntityState, SlotState};

use crate::backends::AfState;
use crate::buffers::BufferHandle;
use crate::errors::{PipelineError, Result};
use crate::pipes::PipeId;
use std::time::Instant;
use tracing::warn;

/// Arena slot index plus generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl FrameId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame#{}.{}", self.index, self.generation)
    }
}

/// What spawned the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Preview,
    /// Second pass over a held bayer buffer
    Reprocessing,
    /// JPEG encode of a held YUV buffer
    Picture,
    Vision,
}

/// Shot metadata collected while the frame flows
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMeta {
    pub timestamp_ns: u64,
    pub faces: u32,
    pub af: AfState,
    /// Main flash fired on this frame
    pub flash_fired: bool,
}

/// Outcome of a finished frame as seen from one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Completed,
    Skipped,
    Failed,
}

/// One capture request's record across the pipe graph
#[derive(Debug)]
pub struct Frame {
    fcount: u32,
    request_key: u64,
    kind: FrameKind,
    entities: Vec<Entity>,
    pub meta: FrameMeta,
    hold_for_capture: bool,
    rework_requests: Vec<PipeId>,
    created_at: Instant,
}

impl Frame {
    /// Build a frame with one REQUESTED entity per pipe of `route`
    pub fn new(fcount: u32, request_key: u64, kind: FrameKind, route: &[PipeId]) -> Self {
        Self {
            fcount,
            request_key,
            kind,
            entities: route.iter().map(|&pipe| Entity::new(pipe)).collect(),
            meta: FrameMeta::default(),
            hold_for_capture: false,
            rework_requests: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn fcount(&self) -> u32 {
        self.fcount
    }

    /// Request that spawned this frame
    pub fn request_key(&self) -> u64 {
        self.request_key
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn route(&self) -> Vec<PipeId> {
        self.entities.iter().map(|e| e.pipe()).collect()
    }

    pub fn has_entity(&self, pipe: PipeId) -> bool {
        self.entities.iter().any(|e| e.pipe() == pipe)
    }

    pub fn entity(&self, pipe: PipeId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.pipe() == pipe)
    }

    pub fn entity_mut(&mut self, pipe: PipeId) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.pipe() == pipe)
    }

    fn require_entity(&mut self, frame: FrameId, pipe: PipeId) -> Result<&mut Entity> {
        self.entity_mut(pipe)
            .ok_or(PipelineError::NoEntity { frame, pipe })
    }

    pub fn entity_state(&self, pipe: PipeId) -> Option<EntityState> {
        self.entity(pipe).map(|e| e.state())
    }

    pub fn set_entity_state(&mut self, id: FrameId, pipe: PipeId, next: EntityState) -> Result<()> {
        self.require_entity(id, pipe)?.transition(next)
    }

    pub fn first_pipe(&self) -> Option<PipeId> {
        self.entities.first().map(|e| e.pipe())
    }

    /// Next stage on this frame's route
    pub fn next_pipe_after(&self, pipe: PipeId) -> Option<PipeId> {
        let position = self.entities.iter().position(|e| e.pipe() == pipe)?;
        self.entities.get(position + 1).map(|e| e.pipe())
    }

    /// Every entity is COMPLETE, FRAME_SKIP or ERROR
    pub fn is_complete(&self) -> bool {
        self.entities.iter().all(|e| e.is_terminal())
    }

    /// Result as seen from one stage's entity
    pub fn outcome(&self, pipe: PipeId) -> Option<FrameOutcome> {
        match self.entity_state(pipe)? {
            EntityState::Complete => Some(FrameOutcome::Completed),
            EntityState::FrameSkip => Some(FrameOutcome::Skipped),
            EntityState::Error => Some(FrameOutcome::Failed),
            _ => None,
        }
    }

    // ===== Capture flags =====

    /// Frame's bayer output goes to the hold list when it completes
    pub fn hold_for_capture(&self) -> bool {
        self.hold_for_capture
    }

    pub fn set_hold_for_capture(&mut self, hold: bool) {
        self.hold_for_capture = hold;
    }

    /// Ask the stage owning `pipe` to re-arm its entity when it completes
    pub fn request_rework(&mut self, pipe: PipeId) -> bool {
        if self.entity_state(pipe) != Some(EntityState::Processing) {
            return false;
        }
        if !self.rework_requests.contains(&pipe) {
            self.rework_requests.push(pipe);
        }
        true
    }

    /// Consume a pending rework request for `pipe`
    pub fn take_rework(&mut self, pipe: PipeId) -> bool {
        match self.rework_requests.iter().position(|&p| p == pipe) {
            Some(position) => {
                self.rework_requests.swap_remove(position);
                true
            }
            None => false,
        }
    }

    // ===== Buffers =====

    /// Move the owned buffer of one direction out of the frame
    pub fn take_buffer(&mut self, pipe: PipeId, is_src: bool) -> Option<BufferHandle> {
        let entity = self.entity_mut(pipe)?;
        if is_src {
            entity.src.take_owned()
        } else {
            entity.dst.take_owned()
        }
    }

    /// Force every entity into a terminal state; returns how many changed
    pub fn abort(&mut self) -> usize {
        self.entities.iter_mut().map(|e| e.abort()).filter(|&changed| changed).count()
    }

    /// Return every owned buffer to its pool; returns how many were returned
    pub(crate) fn release_buffers(&mut self) -> usize {
        self.return_buffers(None)
    }

    /// Return every owned buffer except the one bound at `keep`
    ///
    /// Used before a frame is parked on a hold list so only the held buffer
    /// stays checked out.
    pub fn release_buffers_except(&mut self, keep: PipeId, keep_src: bool) -> usize {
        self.return_buffers(Some((keep, keep_src)))
    }

    fn return_buffers(&mut self, keep: Option<(PipeId, bool)>) -> usize {
        let mut released = 0;
        for entity in self.entities.iter_mut() {
            let failed = entity.state() != EntityState::Complete;
            let pipe = entity.pipe();
            for (is_src, slot) in [(true, &mut entity.src), (false, &mut entity.dst)] {
                if keep == Some((pipe, is_src)) {
                    continue;
                }
                if let Some(handle) = slot.take_owned() {
                    let result = if failed { handle.cancel() } else { handle.put() };
                    match result {
                        Ok(_) => released += 1,
                        Err(e) => warn!(fcount = self.fcount, error = %e, "Failed to return buffer"),
                    }
                }
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Vec<PipeId> {
        vec![PipeId::Flite, PipeId::ThreeAaIsp, PipeId::Scp]
    }

    #[test]
    fn test_route_navigation() {
        let frame = Frame::new(1, 1, FrameKind::Preview, &route());
        assert_eq!(frame.first_pipe(), Some(PipeId::Flite));
        assert_eq!(frame.next_pipe_after(PipeId::Flite), Some(PipeId::ThreeAaIsp));
        assert_eq!(frame.next_pipe_after(PipeId::Scp), None);
        assert_eq!(frame.next_pipe_after(PipeId::Jpeg), None);
    }

    #[test]
    fn test_complete_when_all_terminal() {
        let id = FrameId::new(0, 0);
        let mut frame = Frame::new(1, 1, FrameKind::Preview, &route());
        assert!(!frame.is_complete());

        for pipe in [PipeId::Flite, PipeId::ThreeAaIsp] {
            frame.set_entity_state(id, pipe, EntityState::Processing).unwrap();
            frame.set_entity_state(id, pipe, EntityState::Complete).unwrap();
        }
        assert!(!frame.is_complete());

        frame.set_entity_state(id, PipeId::Scp, EntityState::FrameSkip).unwrap();
        assert!(frame.is_complete());
        assert_eq!(frame.outcome(PipeId::Scp), Some(FrameOutcome::Skipped));
    }

    #[test]
    fn test_missing_entity() {
        let mut frame = Frame::new(1, 1, FrameKind::Preview, &route());
        let result = frame.set_entity_state(FrameId::new(0, 0), PipeId::Jpeg, EntityState::Processing);
        assert!(matches!(result, Err(PipelineError::NoEntity { .. })));
    }

    #[test]
    fn test_rework_request_requires_processing() {
        let id = FrameId::new(0, 0);
        let mut frame = Frame::new(1, 1, FrameKind::Preview, &route());
        assert!(!frame.request_rework(PipeId::Flite));

        frame.set_entity_state(id, PipeId::Flite, EntityState::Processing).unwrap();
        assert!(frame.request_rework(PipeId::Flite));
        assert!(frame.take_rework(PipeId::Flite));
        assert!(!frame.take_rework(PipeId::Flite));
    }

    #[test]
    fn test_release_except_keeps_held_buffer() {
        use crate::backends::HeapMemory;
        use crate::buffers::{AllocMode, BufferPool};
        use std::sync::Arc;

        let pool = BufferPool::new("sensor", Arc::new(HeapMemory::new()));
        pool.alloc(&[64], 3, 3, AllocMode::AtOnce).unwrap();
        let id = FrameId::new(0, 0);
        let mut frame = Frame::new(1, 1, FrameKind::Preview, &route());
        for pipe in route() {
            let entity = frame.entity_mut(pipe).unwrap();
            entity.dst.attach_owned(pool.get().unwrap());
            frame.set_entity_state(id, pipe, EntityState::Processing).unwrap();
            frame.set_entity_state(id, pipe, EntityState::Complete).unwrap();
        }
        assert_eq!(frame.release_buffers_except(PipeId::Flite, false), 2);
        assert_eq!(pool.available(), 2);
        assert!(frame.entity(PipeId::Flite).unwrap().dst.is_owned());
    }

    #[test]
    fn test_abort_reaches_terminal() {
        let id = FrameId::new(0, 0);
        let mut frame = Frame::new(1, 1, FrameKind::Preview, &route());
        frame.set_entity_state(id, PipeId::Flite, EntityState::Processing).unwrap();
        assert_eq!(frame.abort(), 3);
        assert!(frame.is_complete());
        assert_eq!(frame.entity_state(PipeId::Flite), Some(EntityState::Error));
        assert_eq!(frame.entity_state(PipeId::Scp), Some(EntityState::FrameSkip));
    }
}
