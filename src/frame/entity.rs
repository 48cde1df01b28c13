// SPDX-License-Identifier: GPL-3.0-only

//! Per-stage entity state machine
//!
//! ```text
//! REQUESTED ──▶ PROCESSING ──▶ COMPLETE
//!     │            │  ▲
//!     │            ▼  │
//!     │          REWORK
//!     ▼
//! FRAME_SKIP        (any non-terminal) ──▶ ERROR
//! ```

use crate::buffers::BufferHandle;
use crate::errors::{PipelineError, Result};
use crate::pipes::PipeId;
use serde::{Deserialize, Serialize};

/// State of one frame's passage through one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    Requested,
    Processing,
    Complete,
    /// Stage intentionally bypassed for this frame
    FrameSkip,
    /// Stage re-armed mid-flight to add an output
    Rework,
    Error,
}

impl EntityState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntityState::Complete | EntityState::FrameSkip | EntityState::Error
        )
    }

    pub fn can_transition_to(&self, next: EntityState) -> bool {
        use EntityState::*;
        match (self, next) {
            (Requested, Processing) | (Requested, FrameSkip) => true,
            (Processing, Complete) | (Processing, Rework) => true,
            (Rework, Processing) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Buffer request state tracked per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SlotState {
    /// Direction not used for this frame
    #[default]
    NoRequest,
    Requested,
    Processing,
    Complete,
    Error,
}

/// Buffer binding for one direction of an entity
///
/// An owned handle is returned to its pool when the frame is deleted. A
/// borrowed handle points at another entity's buffer and is never released
/// through this slot.
#[derive(Debug, Clone, Default)]
pub struct BufferSlot {
    handle: Option<BufferHandle>,
    owned: bool,
    state: SlotState,
}

impl BufferSlot {
    pub fn attach_owned(&mut self, handle: BufferHandle) {
        self.handle = Some(handle);
        self.owned = true;
        self.state = SlotState::Requested;
    }

    pub fn attach_borrowed(&mut self, handle: BufferHandle) {
        self.handle = Some(handle);
        self.owned = false;
        self.state = SlotState::Requested;
    }

    /// Take the handle out if this slot owns it
    pub fn take_owned(&mut self) -> Option<BufferHandle> {
        if self.owned {
            self.owned = false;
            self.handle.take()
        } else {
            None
        }
    }

    pub fn handle(&self) -> Option<&BufferHandle> {
        self.handle.as_ref()
    }

    pub fn index(&self) -> Option<usize> {
        self.handle.as_ref().map(|h| h.index())
    }

    pub fn is_owned(&self) -> bool {
        self.owned && self.handle.is_some()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn set_state(&mut self, state: SlotState) {
        self.state = state;
    }
}

/// A frame's record of one stage
#[derive(Debug, Clone)]
pub struct Entity {
    pipe: PipeId,
    state: EntityState,
    pub src: BufferSlot,
    pub dst: BufferSlot,
    reworks: u32,
}

impl Entity {
    pub fn new(pipe: PipeId) -> Self {
        Self {
            pipe,
            state: EntityState::Requested,
            src: BufferSlot::default(),
            dst: BufferSlot::default(),
            reworks: 0,
        }
    }

    pub fn pipe(&self) -> PipeId {
        self.pipe
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Times this entity was re-armed
    pub fn reworks(&self) -> u32 {
        self.reworks
    }

    pub fn transition(&mut self, next: EntityState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                pipe: self.pipe,
                from: self.state,
                to: next,
            });
        }
        if next == EntityState::Rework {
            self.reworks += 1;
        }
        self.state = next;

        let slot_state = match next {
            EntityState::Processing | EntityState::Rework => Some(SlotState::Processing),
            EntityState::Complete => Some(SlotState::Complete),
            EntityState::Error => Some(SlotState::Error),
            EntityState::FrameSkip | EntityState::Requested => None,
        };
        if let Some(slot_state) = slot_state {
            for slot in [&mut self.src, &mut self.dst] {
                if slot.handle.is_some() {
                    slot.state = slot_state;
                }
            }
        }
        Ok(())
    }

    /// Force a terminal state: REQUESTED becomes FRAME_SKIP, anything in
    /// flight becomes ERROR. Returns `false` if already terminal.
    pub fn abort(&mut self) -> bool {
        let next = match self.state {
            EntityState::Requested => EntityState::FrameSkip,
            EntityState::Processing | EntityState::Rework => EntityState::Error,
            _ => return false,
        };
        self.transition(next).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut entity = Entity::new(PipeId::Isp);
        entity.transition(EntityState::Processing).unwrap();
        entity.transition(EntityState::Complete).unwrap();
        assert!(entity.is_terminal());
    }

    #[test]
    fn test_rework_cycle() {
        let mut entity = Entity::new(PipeId::Flite);
        entity.transition(EntityState::Processing).unwrap();
        entity.transition(EntityState::Rework).unwrap();
        entity.transition(EntityState::Processing).unwrap();
        entity.transition(EntityState::Complete).unwrap();
        assert_eq!(entity.reworks(), 1);
    }

    #[test]
    fn test_no_regression_from_terminal() {
        for terminal in [
            EntityState::Complete,
            EntityState::FrameSkip,
            EntityState::Error,
        ] {
            for next in [
                EntityState::Requested,
                EntityState::Processing,
                EntityState::Complete,
                EntityState::FrameSkip,
                EntityState::Rework,
                EntityState::Error,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} -> {:?} must be rejected",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn test_skip_only_from_requested() {
        let mut entity = Entity::new(PipeId::Scp);
        entity.transition(EntityState::Processing).unwrap();
        assert!(entity.transition(EntityState::FrameSkip).is_err());
        assert_eq!(entity.state(), EntityState::Processing);
    }

    #[test]
    fn test_abort() {
        let mut requested = Entity::new(PipeId::Scp);
        assert!(requested.abort());
        assert_eq!(requested.state(), EntityState::FrameSkip);

        let mut processing = Entity::new(PipeId::Scp);
        processing.transition(EntityState::Processing).unwrap();
        assert!(processing.abort());
        assert_eq!(processing.state(), EntityState::Error);

        assert!(!processing.abort());
    }
}
