// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for hold lists and selection policies

use camera_pipeline::backends::{AfState, HeapMemory};
use camera_pipeline::buffers::{AllocMode, BufferPool};
use camera_pipeline::config::TimingConfig;
use camera_pipeline::frame::{EntityState, Frame, FrameArena, FrameId, FrameKind};
use camera_pipeline::selector::{CaptureIntent, CaptureSelector, SelectionPolicy};
use camera_pipeline::{PipeId, PipelineError};
use std::sync::Arc;

struct Fixture {
    arena: Arc<FrameArena>,
    pool: Arc<BufferPool>,
    selector: CaptureSelector,
}

impl Fixture {
    fn new(buffers: usize, capacity: usize) -> Self {
        let pool = BufferPool::new("sensor", Arc::new(HeapMemory::new()));
        pool.alloc(&[256], buffers, buffers, AllocMode::AtOnce).unwrap();
        let arena = FrameArena::new();
        let timing = TimingConfig {
            waiting_time_ms: 1,
            dm_waiting_time_ms: 1,
            selector_hold_wait_ms: 200,
            ..TimingConfig::default()
        };
        let selector = CaptureSelector::new(Arc::clone(&arena), capacity, timing);
        Self { arena, pool, selector }
    }

    /// Complete a frame at `pipe` with a buffer and hand it to the selector
    fn hold(&self, pipe: PipeId, is_source: bool, fcount: u32, af: AfState) -> FrameId {
        let mut frame = Frame::new(fcount, fcount as u64, FrameKind::Preview, &[pipe]);
        frame.meta.af = af;
        let entity = frame.entity_mut(pipe).unwrap();
        let buffer = self.pool.get().unwrap();
        if is_source {
            entity.src.attach_owned(buffer);
        } else {
            entity.dst.attach_owned(buffer);
        }
        entity.transition(EntityState::Processing).unwrap();
        entity.transition(EntityState::Complete).unwrap();
        let id = self.arena.insert(frame);
        assert!(self.selector.manage_frame_hold_list(id, pipe, is_source).unwrap());
        id
    }
}

#[test]
fn test_intent_priority() {
    let everything = CaptureIntent {
        flash_fcount: Some(10),
        hdr_trigger: Some(20),
        after_fcount: Some(30),
        wait_focus: true,
    };
    assert_eq!(
        SelectionPolicy::from_intent(&everything),
        SelectionPolicy::Flash { fcount: 10 }
    );
    let no_flash = CaptureIntent {
        flash_fcount: None,
        ..everything
    };
    assert_eq!(
        SelectionPolicy::from_intent(&no_flash),
        SelectionPolicy::Hdr { trigger: 20 }
    );
    let focus_only = CaptureIntent {
        wait_focus: true,
        ..CaptureIntent::default()
    };
    assert_eq!(SelectionPolicy::from_intent(&focus_only), SelectionPolicy::Focused);
    assert_eq!(
        SelectionPolicy::from_intent(&CaptureIntent::default()),
        SelectionPolicy::Oldest
    );
}

#[test]
fn test_hdr_bracket_takes_consecutive_frames() {
    let fx = Fixture::new(6, 6);
    for fcount in 10..16 {
        fx.hold(PipeId::Flite, false, fcount, AfState::Focused);
    }
    fx.selector
        .set_policy(Some(SelectionPolicy::Hdr { trigger: 12 }));

    let mut picked = Vec::new();
    for shot in 0..3 {
        let selected = fx.selector.select_frames(shot, PipeId::Flite, false, 5).unwrap();
        picked.push(selected.fcount());
    }
    assert_eq!(picked, vec![12, 13, 14]);
    // 10 and 11 predate the bracket and were evicted, 15 stays held
    assert_eq!(fx.selector.held(PipeId::Flite, false).len(), 1);
    assert_eq!(fx.pool.available(), 5);
}

#[test]
fn test_focus_wait_skips_scanning_frames() {
    let fx = Fixture::new(4, 4);
    fx.hold(PipeId::Flite, false, 1, AfState::Scanning);
    fx.hold(PipeId::Flite, false, 2, AfState::Scanning);
    fx.hold(PipeId::Flite, false, 3, AfState::Focused);
    fx.selector.set_policy(Some(SelectionPolicy::Focused));

    let selected = fx.selector.select_frames(0, PipeId::Flite, false, 3).unwrap();
    assert_eq!(selected.fcount(), 3);
    assert_eq!(fx.selector.stats().evicted, 2);
}

#[test]
fn test_lists_are_keyed_by_pipe_and_direction() {
    let fx = Fixture::new(4, 2);
    fx.hold(PipeId::Flite, false, 1, AfState::Focused);
    fx.hold(PipeId::ThreeAc, false, 2, AfState::Focused);
    fx.hold(PipeId::ThreeAc, true, 3, AfState::Focused);

    assert_eq!(fx.selector.len(), 3);
    let selected = fx.selector.select_frames(0, PipeId::ThreeAc, true, 1).unwrap();
    assert_eq!(selected.fcount(), 3);
    assert!(selected.take_buffer().is_some());
    drop(selected);
    assert_eq!(fx.selector.held(PipeId::ThreeAc, false).len(), 1);
    assert_eq!(fx.selector.held(PipeId::Flite, false).len(), 1);
}

#[test]
fn test_selected_frame_pins_until_dropped() {
    let fx = Fixture::new(2, 2);
    let id = fx.hold(PipeId::Flite, false, 7, AfState::Focused);
    let selected = fx.selector.select_frames(0, PipeId::Flite, false, 1).unwrap();
    assert_eq!(selected.id(), id);
    assert!(fx.arena.is_locked(id));

    fx.selector.clear_list();
    assert!(fx.arena.contains(id));
    drop(selected);
    assert!(!fx.arena.contains(id));
    assert_eq!(fx.pool.available(), 2);
}

#[test]
fn test_cancel_before_selection_empties_lists() {
    let fx = Fixture::new(3, 3);
    for fcount in 1..=3 {
        fx.hold(PipeId::Flite, false, fcount, AfState::Focused);
    }
    assert_eq!(fx.selector.cancel_picture(), 3);
    assert!(fx.selector.is_empty());
    assert_eq!(fx.pool.available(), 3);
    assert_eq!(fx.arena.live(), 0);

    let result = fx.selector.select_frames(0, PipeId::Flite, false, 2);
    assert!(matches!(result, Err(PipelineError::SelectionTimeout { .. })));
}

#[test]
fn test_stats_serialize() {
    let fx = Fixture::new(2, 2);
    fx.hold(PipeId::Flite, false, 1, AfState::Focused);
    drop(fx.selector.select_frames(0, PipeId::Flite, false, 1).unwrap());

    let json = serde_json::to_value(fx.selector.stats()).unwrap();
    assert_eq!(json["inserted"], 1);
    assert_eq!(json["selected"], 1);
}
