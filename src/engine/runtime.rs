// SPDX-License-Identifier: GPL-3.0-only

//! State shared by the workers of one running session
//!
//! ```text
//!            feeder ─▶ stream graph ─▶ frame_done ─┬─▶ recording ─▶ on_video_frame
//!                                                  ├─▶ faces ─────▶ on_frame_metadata
//!                                                  └─▶ hold list
//! take_picture ─▶ shutter ─▶ picture ─(select)─▶ reprocessing graph
//!                                                  └─▶ post_picture ─▶ save ×N ─▶ on_picture_done
//! ```

use super::bayer::{BayerArming, ReprocessingBayerMode};
use super::context::SessionContext;
use super::inflight::InFlightList;
use super::state::{SessionState, SessionStateMachine};
use crate::backends::{CallbackBuffer, HostCallbacks};
use crate::buffers::{BufferHandle, BufferPools};
use crate::config::CaptureConfig;
use crate::errors::HostErrorCode;
use crate::factory::PipeGraph;
use crate::frame::{FrameArena, FrameId};
use crate::pipes::{FrameQueue, PipeId};
use crate::selector::{CaptureIntent, CaptureSelector};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Still capture handed from `take_picture` to the capture workers
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest {
    /// Sync-log id of the request
    pub seq: u64,
    pub shots: u32,
    pub intent: CaptureIntent,
}

/// Finished still waiting for a save worker
#[derive(Debug)]
pub struct SaveJob {
    pub seq: u64,
    pub fcount: u32,
    pub timestamp_ns: u64,
    pub buffer: BufferHandle,
}

/// Recording-scaler output waiting for the recording worker
#[derive(Debug)]
pub struct VideoJob {
    pub fcount: u32,
    pub timestamp_ns: u64,
    pub buffer: BufferHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceEvent {
    pub fcount: u32,
    pub faces: u32,
}

/// Queues between the engine workers
pub struct Queues {
    pub frame_done: FrameQueue,
    pub post_picture: FrameQueue,
    pub shutter: FrameQueue<CaptureRequest>,
    pub picture: FrameQueue<CaptureRequest>,
    pub save: FrameQueue<SaveJob>,
    pub recording: FrameQueue<VideoJob>,
    pub faces: FrameQueue<FaceEvent>,
}

impl Queues {
    fn new() -> Self {
        Self {
            frame_done: FrameQueue::new("frame-done"),
            post_picture: FrameQueue::new("post-picture"),
            shutter: FrameQueue::new("shutter"),
            picture: FrameQueue::new("picture"),
            save: FrameQueue::new("jpeg-save"),
            recording: FrameQueue::new("recording"),
            faces: FrameQueue::new("faces"),
        }
    }
}

/// Progress of the capture sequence currently running
#[derive(Debug, Clone, Copy)]
struct ActiveCapture {
    seq: u64,
    shots: u32,
    submitted: u32,
    delivered: u32,
    failed: u32,
    /// Picture worker is still selecting frames for this sequence
    selecting: bool,
}

impl ActiveCapture {
    fn is_done(&self) -> bool {
        !self.selecting && self.delivered + self.failed >= self.shots
    }
}

/// Everything the workers of one preview run share
pub struct Runtime {
    pub config: CaptureConfig,
    pub mode: ReprocessingBayerMode,
    pub arena: Arc<FrameArena>,
    pub pools: Arc<BufferPools>,
    pub callbacks: Arc<dyn HostCallbacks>,
    pub context: Arc<SessionContext>,
    pub state: Arc<Mutex<SessionStateMachine>>,
    pub inflight: InFlightList,
    pub selector: CaptureSelector,
    pub bayer: Mutex<BayerArming>,
    /// Preview or vision graph the feeder drives
    pub stream: Arc<PipeGraph>,
    /// Stage whose outcome decides a stream frame's outcome
    pub output_pipe: PipeId,
    pub reprocessing: Option<Arc<PipeGraph>>,
    pub queues: Queues,
    /// Shared stop flag of the output workers
    pub stop: Arc<AtomicBool>,
    /// Frames the feeder may still generate; `u64::MAX` is unlimited
    pub frame_limit: Arc<AtomicU64>,
    /// Set by the watchdog after escalation
    pub faulted: AtomicBool,
    /// Video frames still to drop after recording started
    pub recording_skip: AtomicU32,
    capture: Mutex<Option<ActiveCapture>>,
}

pub struct RuntimeParts {
    pub config: CaptureConfig,
    pub arena: Arc<FrameArena>,
    pub pools: Arc<BufferPools>,
    pub callbacks: Arc<dyn HostCallbacks>,
    pub context: Arc<SessionContext>,
    pub state: Arc<Mutex<SessionStateMachine>>,
    pub stream: Arc<PipeGraph>,
    pub output_pipe: PipeId,
    pub reprocessing: Option<Arc<PipeGraph>>,
    pub frame_limit: Arc<AtomicU64>,
}

impl Runtime {
    pub fn new(parts: RuntimeParts) -> Self {
        let config = parts.config;
        let mode = ReprocessingBayerMode::from_config(&config.bayer);
        let capacity = if mode.is_reprocessing() {
            config.bayer.hold_count
        } else {
            config.scaled_buffers().picture.saturating_sub(1).max(1)
        };
        Self {
            mode,
            inflight: InFlightList::new("in-flight", Arc::clone(&parts.arena)),
            selector: CaptureSelector::new(Arc::clone(&parts.arena), capacity, config.timing),
            bayer: Mutex::new(BayerArming::new(mode)),
            queues: Queues::new(),
            stop: Arc::new(AtomicBool::new(false)),
            faulted: AtomicBool::new(false),
            recording_skip: AtomicU32::new(0),
            capture: Mutex::new(None),
            arena: parts.arena,
            pools: parts.pools,
            callbacks: parts.callbacks,
            context: parts.context,
            state: parts.state,
            stream: parts.stream,
            output_pipe: parts.output_pipe,
            reprocessing: parts.reprocessing,
            frame_limit: parts.frame_limit,
            config,
        }
    }

    pub fn lock_state(&self) -> MutexGuard<'_, SessionStateMachine> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lock_bayer(&self) -> MutexGuard<'_, BayerArming> {
        self.bayer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_capture(&self) -> MutexGuard<'_, Option<ActiveCapture>> {
        self.capture.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Drop the caller's reference to a frame
    pub fn release(&self, id: FrameId, reason: &str) {
        if let Err(e) = self.arena.release(id) {
            self.context.list_error();
            warn!(%id, reason, error = %e, "Frame release failed");
        }
    }

    /// Force a frame's unfinished entities to a terminal state
    ///
    /// Returns `true` if any entity changed.
    pub fn abort_frame(&self, id: FrameId) -> bool {
        match self.arena.with_mut(id, |frame| frame.abort()) {
            Ok(0) => false,
            Ok(aborted) => {
                debug!(%id, aborted, "Frame cut off mid-route");
                true
            }
            Err(e) => {
                self.context.list_error();
                warn!(%id, error = %e, "Frame to abort already gone");
                false
            }
        }
    }

    pub fn report_error(&self, code: HostErrorCode) {
        self.context.error_fired();
        self.callbacks.on_error(code);
    }

    // ===== Capture sequence bookkeeping =====

    pub fn capture_active(&self) -> bool {
        self.lock_capture().is_some()
    }

    pub fn begin_capture(&self, seq: u64, shots: u32) {
        *self.lock_capture() = Some(ActiveCapture {
            seq,
            shots,
            submitted: 0,
            delivered: 0,
            failed: 0,
            selecting: true,
        });
    }

    /// A shot's frame entered the encode path
    pub fn shot_submitted(&self, seq: u64) {
        if let Some(capture) = self.lock_capture().as_mut().filter(|c| c.seq == seq) {
            capture.submitted += 1;
        }
    }

    /// A shot ended, delivered or not
    pub fn shot_finished(&self, seq: u64, delivered: bool) {
        self.update_capture(seq, |capture| {
            if delivered {
                capture.delivered += 1;
            } else {
                capture.failed += 1;
            }
        });
    }

    /// The picture worker has handled every shot of `seq`
    pub fn selection_finished(&self, seq: u64) {
        self.update_capture(seq, |capture| capture.selecting = false);
    }

    fn update_capture(&self, seq: u64, apply: impl FnOnce(&mut ActiveCapture)) {
        let finished = {
            let mut guard = self.lock_capture();
            match guard.as_mut().filter(|c| c.seq == seq) {
                Some(capture) => {
                    apply(capture);
                    if capture.is_done() { guard.take() } else { None }
                }
                None => None,
            }
        };
        if let Some(capture) = finished {
            self.finish_capture(capture, false);
        }
    }

    /// End `seq` early after `cancel_picture`; the host gets no error
    pub fn capture_cancelled(&self, seq: u64) {
        let cancelled = {
            let mut guard = self.lock_capture();
            match *guard {
                Some(capture) if capture.seq == seq => guard.take(),
                _ => None,
            }
        };
        if let Some(capture) = cancelled {
            self.finish_capture(capture, true);
        }
    }

    fn finish_capture(&self, capture: ActiveCapture, cancelled: bool) {
        if cancelled {
            info!(seq = capture.seq, delivered = capture.delivered, "Capture sequence cancelled");
        } else if capture.delivered == 0 {
            warn!(seq = capture.seq, shots = capture.shots, "Every shot of the capture failed");
            self.context.capture_failed();
            self.report_error(HostErrorCode::CaptureFailed);
        } else {
            info!(
                seq = capture.seq,
                submitted = capture.submitted,
                delivered = capture.delivered,
                failed = capture.failed,
                "Capture sequence finished"
            );
        }
        self.selector.set_policy(None);
        {
            // Held under the arming lock so a late flagged frame cannot slip in
            let mut bayer = self.lock_bayer();
            self.context.holds_withdrawn(bayer.disarm());
            if self.mode.is_dynamic() {
                let dropped = self.selector.clear_list();
                if dropped > 0 {
                    debug!(seq = capture.seq, dropped, "Unused dynamic holds released");
                }
            }
        }

        let mut state = self.lock_state();
        if state.state() == SessionState::CaptureInProgress {
            let next = state.after_capture();
            if let Err(e) = state.transition(next, "capture") {
                warn!(error = %e, "Capture could not return to streaming");
            }
        }
    }

    /// Cancel any hold flags not yet taken by a generated frame
    pub fn withdraw_arming(&self) -> u32 {
        let withdrawn = self.lock_bayer().disarm();
        self.context.holds_withdrawn(withdrawn);
        withdrawn
    }

    /// Forget the running sequence without notifying the host
    pub fn abandon_capture(&self) {
        if let Some(capture) = self.lock_capture().take() {
            debug!(seq = capture.seq, "Capture sequence abandoned");
        }
    }

    // ===== Teardown =====

    /// Empty every worker queue after the workers stopped
    ///
    /// Frame ids lose their carrier reference; jobs give their buffers back.
    pub fn drain_queues(&self) -> usize {
        let queues = &self.queues;
        let mut drained = 0;
        for id in queues.frame_done.drain().into_iter().chain(queues.post_picture.drain()) {
            self.release(id, "queue drain");
            drained += 1;
        }
        let jobs = queues.save.drain().into_iter().map(|job| (job.fcount, job.buffer));
        let videos = queues.recording.drain().into_iter().map(|job| (job.fcount, job.buffer));
        for (fcount, buffer) in jobs.chain(videos) {
            let pool = buffer.pool_name().to_string();
            if let Err(e) = buffer.cancel() {
                warn!(fcount, pool = %pool, error = %e, "Queued buffer could not be returned");
            }
            drained += 1;
        }
        drained += queues.shutter.drain().len();
        drained += queues.picture.drain().len();
        drained += queues.faces.drain().len();
        drained
    }
}

/// Read-only view of a buffer for a host callback
pub fn callback_buffer(buffer: &BufferHandle, fcount: u32, timestamp_ns: u64) -> CallbackBuffer {
    CallbackBuffer {
        fcount,
        pool: buffer.pool_name().to_string(),
        index: buffer.index(),
        planes: buffer.planes().to_vec(),
        timestamp_ns,
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("mode", &self.mode)
            .field("stream", &self.stream.name())
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}
