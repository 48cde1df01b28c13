// SPDX-License-Identifier: GPL-3.0-only

//! Per-session counters and identity
//!
//! One context is created per preview start and handed to every worker.
//! High-frequency counters are atomics so the hot path never takes a lock;
//! only the fps meter sits behind a mutex.

use crate::frame::FrameOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Window the preview fps is averaged over
const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Sliding-window frame rate of delivered preview frames
#[derive(Debug, Default)]
struct FpsMeter {
    stamps: VecDeque<Instant>,
}

impl FpsMeter {
    fn tick(&mut self, now: Instant) {
        self.stamps.push_back(now);
        while let Some(&oldest) = self.stamps.front() {
            if now.duration_since(oldest) > FPS_WINDOW {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.stamps.front(), self.stamps.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (self.stamps.len() - 1) as f64 / span
    }
}

/// Frame counters of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCounters {
    pub generated: u64,
    /// Generation ticks given up for lack of a sensor buffer
    pub generation_skips: u64,
    pub completed: u64,
    pub skipped: u64,
    pub errored: u64,
    /// Hold flags armed for dynamic captures
    pub hold_armed: u64,
    /// Armed flags withdrawn before a frame took them
    pub hold_withdrawn: u64,
    /// Frames generated with the hold-for-capture flag
    pub hold_flagged: u64,
    /// Flagged frames that never made it onto a hold list
    pub hold_dropped: u64,
}

impl FrameCounters {
    /// Frames that reached the frame-done worker
    pub fn finished(&self) -> u64 {
        self.completed + self.skipped + self.errored
    }
}

/// Host notifications fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackCounters {
    pub shutter: u64,
    pub metadata: u64,
    pub preview: u64,
    pub video: u64,
    pub picture: u64,
    pub error: u64,
}

/// Serializable snapshot of a [`SessionContext`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub frames: FrameCounters,
    pub callbacks: CallbackCounters,
    pub selection_timeouts: u64,
    pub captures_failed: u64,
    /// Ownership errors seen on the frame lists
    pub list_errors: u64,
    pub sync_log_id: u64,
    pub preview_fps: f64,
}

/// Counters and identity shared by the workers of one session
#[derive(Debug)]
pub struct SessionContext {
    id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    next_fcount: AtomicU32,
    sync_log_id: AtomicU64,

    generated: AtomicU64,
    generation_skips: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
    errored: AtomicU64,
    hold_armed: AtomicU64,
    hold_withdrawn: AtomicU64,
    hold_flagged: AtomicU64,
    hold_dropped: AtomicU64,

    shutter: AtomicU64,
    metadata: AtomicU64,
    preview: AtomicU64,
    video: AtomicU64,
    picture: AtomicU64,
    error: AtomicU64,

    selection_timeouts: AtomicU64,
    captures_failed: AtomicU64,
    list_errors: AtomicU64,
    fps: Mutex<FpsMeter>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            next_fcount: AtomicU32::new(1),
            sync_log_id: AtomicU64::new(0),
            generated: AtomicU64::new(0),
            generation_skips: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            hold_armed: AtomicU64::new(0),
            hold_withdrawn: AtomicU64::new(0),
            hold_flagged: AtomicU64::new(0),
            hold_dropped: AtomicU64::new(0),
            shutter: AtomicU64::new(0),
            metadata: AtomicU64::new(0),
            preview: AtomicU64::new(0),
            video: AtomicU64::new(0),
            picture: AtomicU64::new(0),
            error: AtomicU64::new(0),
            selection_timeouts: AtomicU64::new(0),
            captures_failed: AtomicU64::new(0),
            list_errors: AtomicU64::new(0),
            fps: Mutex::new(FpsMeter::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Frame count for the next generated frame, starting at 1
    pub fn next_fcount(&self) -> u32 {
        self.next_fcount.fetch_add(1, Ordering::Relaxed)
    }

    /// Id tagging one capture request across the worker logs
    pub fn next_sync_log_id(&self) -> u64 {
        self.sync_log_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ===== Frames =====

    pub fn frame_generated(&self) {
        self.generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_skipped(&self) {
        self.generation_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn holds_armed(&self, frames: u32) {
        self.hold_armed.fetch_add(u64::from(frames), Ordering::Relaxed);
    }

    pub fn holds_withdrawn(&self, frames: u32) {
        self.hold_withdrawn.fetch_add(u64::from(frames), Ordering::Relaxed);
    }

    pub fn hold_flagged(&self) {
        self.hold_flagged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hold_dropped(&self) {
        self.hold_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    /// Count a finished frame; returns how many have finished so far
    pub fn frame_finished(&self, outcome: FrameOutcome) -> u64 {
        let counter = match outcome {
            FrameOutcome::Completed => &self.completed,
            FrameOutcome::Skipped => &self.skipped,
            FrameOutcome::Failed => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.frames().finished()
    }

    pub fn frames(&self) -> FrameCounters {
        FrameCounters {
            generated: self.generated.load(Ordering::Relaxed),
            generation_skips: self.generation_skips.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            hold_armed: self.hold_armed.load(Ordering::Relaxed),
            hold_withdrawn: self.hold_withdrawn.load(Ordering::Relaxed),
            hold_flagged: self.hold_flagged.load(Ordering::Relaxed),
            hold_dropped: self.hold_dropped.load(Ordering::Relaxed),
        }
    }

    // ===== Callbacks =====

    pub fn shutter_fired(&self) {
        self.shutter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metadata_fired(&self) {
        self.metadata.fetch_add(1, Ordering::Relaxed);
    }

    pub fn preview_fired(&self) {
        self.preview.fetch_add(1, Ordering::Relaxed);
        self.fps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tick(Instant::now());
    }

    pub fn video_fired(&self) {
        self.video.fetch_add(1, Ordering::Relaxed);
    }

    pub fn picture_fired(&self) {
        self.picture.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_fired(&self) {
        self.error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callbacks(&self) -> CallbackCounters {
        CallbackCounters {
            shutter: self.shutter.load(Ordering::Relaxed),
            metadata: self.metadata.load(Ordering::Relaxed),
            preview: self.preview.load(Ordering::Relaxed),
            video: self.video.load(Ordering::Relaxed),
            picture: self.picture.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
        }
    }

    // ===== Capture =====

    pub fn selection_timed_out(&self) {
        self.selection_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capture_failed(&self) {
        self.captures_failed.fetch_add(1, Ordering::Relaxed);
    }

    // ===== Ownership =====

    pub fn list_error(&self) {
        self.list_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn list_errors(&self) -> u64 {
        self.list_errors.load(Ordering::Relaxed)
    }

    pub fn preview_fps(&self) -> f64 {
        self.fps.lock().unwrap_or_else(|e| e.into_inner()).fps()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            session_id: self.id,
            started_at: self.started_at,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            frames: self.frames(),
            callbacks: self.callbacks(),
            selection_timeouts: self.selection_timeouts.load(Ordering::Relaxed),
            captures_failed: self.captures_failed.load(Ordering::Relaxed),
            list_errors: self.list_errors(),
            sync_log_id: self.sync_log_id.load(Ordering::Relaxed),
            preview_fps: self.preview_fps(),
        }
    }
}
