// SPDX-License-Identifier: GPL-3.0-only

//! Frames generated but not yet finished
//!
//! The list owns one arena reference per entry, on top of the reference
//! carried by whichever queue or pipe currently moves the frame.

use crate::errors::{PipelineError, Result};
use crate::frame::{FrameArena, FrameId};
use crate::pipes::PipeId;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub struct InFlightList {
    name: &'static str,
    arena: Arc<FrameArena>,
    frames: Mutex<VecDeque<FrameId>>,
}

impl InFlightList {
    pub fn new(name: &'static str, arena: Arc<FrameArena>) -> Self {
        Self {
            name,
            arena,
            frames: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<FrameId>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track `id`, taking a reference of its own
    pub fn insert(&self, id: FrameId) -> Result<()> {
        self.arena.retain(id)?;
        self.lock().push_back(id);
        Ok(())
    }

    /// Stop tracking `id` and drop the list's reference
    ///
    /// A frame missing from the list is reported as list corruption.
    pub fn remove(&self, id: FrameId) -> Result<()> {
        let found = {
            let mut frames = self.lock();
            match frames.iter().position(|&f| f == id) {
                Some(position) => frames.remove(position).is_some(),
                None => false,
            }
        };
        if !found {
            return Err(PipelineError::FrameListCorruption {
                list: self.name.to_string(),
                frame: id,
            });
        }
        self.arena.release(id)?;
        Ok(())
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.lock().contains(&id)
    }

    pub fn ids(&self) -> Vec<FrameId> {
        self.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ask every tracked frame still processing at `pipe` to rework it
    pub fn request_rework(&self, pipe: PipeId) -> usize {
        let ids = self.ids();
        let reworked = ids
            .into_iter()
            .filter(|&id| {
                self.arena
                    .with_mut(id, |frame| frame.request_rework(pipe))
                    .unwrap_or(false)
            })
            .count();
        if reworked > 0 {
            debug!(list = self.name, pipe = %pipe, reworked, "In-flight frames re-armed");
        }
        reworked
    }

    /// Empty the list, handing each entry's reference to the caller
    pub fn drain(&self) -> Vec<FrameId> {
        let ids: Vec<FrameId> = self.lock().drain(..).collect();
        if !ids.is_empty() {
            debug!(list = self.name, frames = ids.len(), "In-flight list drained");
        }
        ids
    }
}

impl std::fmt::Debug for InFlightList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightList")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{EntityState, Frame, FrameKind};

    fn setup() -> (Arc<FrameArena>, InFlightList) {
        let arena = FrameArena::new();
        let list = InFlightList::new("preview", arena.clone());
        (arena, list)
    }

    #[test]
    fn test_list_holds_its_own_reference() {
        let (arena, list) = setup();
        let id = arena.insert(Frame::new(1, 1, FrameKind::Preview, &[PipeId::Flite]));
        list.insert(id).unwrap();
        assert_eq!(arena.owners(id), Some(2));

        arena.release(id).unwrap();
        assert!(arena.contains(id));
        list.remove(id).unwrap();
        assert!(!arena.contains(id));
    }

    #[test]
    fn test_missing_frame_is_corruption() {
        let (arena, list) = setup();
        let id = arena.insert(Frame::new(1, 1, FrameKind::Preview, &[PipeId::Flite]));
        assert!(matches!(
            list.remove(id),
            Err(PipelineError::FrameListCorruption { .. })
        ));
        arena.release(id).unwrap();
    }

    #[test]
    fn test_rework_only_processing_frames() {
        let (arena, list) = setup();
        let waiting = arena.insert(Frame::new(1, 1, FrameKind::Preview, &[PipeId::Flite]));
        let running = arena.insert(Frame::new(2, 2, FrameKind::Preview, &[PipeId::Flite]));
        arena
            .with_mut(running, |f| f.set_entity_state(running, PipeId::Flite, EntityState::Processing))
            .unwrap()
            .unwrap();
        list.insert(waiting).unwrap();
        list.insert(running).unwrap();

        assert_eq!(list.request_rework(PipeId::Flite), 1);
        assert!(arena.with_mut(running, |f| f.take_rework(PipeId::Flite)).unwrap());

        arena.release(waiting).unwrap();
        arena.release(running).unwrap();
        let drained = list.drain();
        assert_eq!(drained, vec![waiting, running]);
        assert!(list.is_empty());
        for id in drained {
            assert!(arena.release(id).unwrap());
        }
        assert_eq!(arena.live(), 0);
    }
}
