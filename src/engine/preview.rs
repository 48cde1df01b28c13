// SPDX-License-Identifier: GPL-3.0-only

//! Preview stream workers
//!
//! The feeder generates one frame per tick into the head of the stream
//! graph. The frame-done worker takes finished frames off the graph's output
//! queue, delivers the preview buffer and routes the frame either to the
//! capture hold list or back to the arena.

use super::bayer::GenerationFlags;
use super::runtime::{FaceEvent, Runtime, VideoJob, callback_buffer};
use super::worker::LoopAction;
use crate::buffers::{BufferGuard, BufferHandle, BufferPool};
use crate::constants::timing::LOG_EVERY_N_FRAMES;
use crate::errors::{PipelineError, Result};
use crate::frame::{EntityState, Frame, FrameId, FrameKind, FrameOutcome};
use crate::pipes::PipeId;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

// ===== Feeder =====

/// Generates stream frames into the head of the stream graph
pub struct Feeder {
    runtime: Arc<Runtime>,
    first_pipe: PipeId,
    source: Arc<BufferPool>,
    last_generated: Option<Instant>,
}

impl Feeder {
    pub fn new(runtime: Arc<Runtime>) -> Result<Self> {
        let head = runtime
            .stream
            .topology()
            .nodes()
            .first()
            .copied()
            .ok_or_else(|| PipelineError::Config("stream graph has no stages".into()))?;
        let role = head.dst.ok_or_else(|| {
            PipelineError::Config(format!("stream head {} writes no buffers", head.pipe))
        })?;
        Ok(Self {
            source: runtime.pools.get(role),
            first_pipe: head.pipe,
            runtime,
            last_generated: None,
        })
    }

    /// One generation tick
    pub fn run_once(&mut self) -> LoopAction {
        let rt = Arc::clone(&self.runtime);
        let timing = rt.config.timing;

        if rt.is_faulted() || rt.context.generated() >= rt.frame_limit.load(Ordering::SeqCst) {
            thread::sleep(timing.queue_wait());
            return LoopAction::Continue;
        }
        if rt.inflight.len() >= rt.config.max_in_flight.max(1) {
            thread::sleep(timing.waiting_time());
            return LoopAction::Continue;
        }
        if let Some(last) = self.last_generated {
            let interval = rt.config.frame_interval();
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }

        let Some(buffer) = self.acquire_source() else {
            rt.context.generation_skipped();
            return LoopAction::Continue;
        };
        self.last_generated = Some(Instant::now());
        if let Err(e) = self.generate(buffer) {
            warn!(error = %e, "Frame generation failed");
        }
        LoopAction::Continue
    }

    /// Sensor buffer for the next frame, retried a bounded number of times
    fn acquire_source(&self) -> Option<BufferGuard> {
        let timing = self.runtime.config.timing;
        let attempts = timing.generate_frame_retry.max(1);
        for attempt in 1..=attempts {
            match self.source.get() {
                Ok(handle) => return Some(BufferGuard::new(handle)),
                Err(e) if e.is_transient() => {
                    trace!(pool = %self.source.name(), attempt, "Source pool empty");
                    if attempt < attempts {
                        thread::sleep(timing.waiting_time());
                    }
                }
                Err(e) => {
                    warn!(pool = %self.source.name(), error = %e, "Source buffer unavailable");
                    return None;
                }
            }
        }
        debug!(pool = %self.source.name(), attempts, "No source buffer, skipping generation tick");
        None
    }

    fn generate(&self, buffer: BufferGuard) -> Result<u32> {
        let rt = &self.runtime;
        let flags = rt.lock_bayer().next_frame();
        if flags.hold {
            rt.context.hold_flagged();
        }
        let launched = self.launch(buffer, flags);
        if launched.is_err() && flags.hold {
            rt.context.hold_dropped();
        }
        launched
    }

    fn launch(&self, buffer: BufferGuard, flags: GenerationFlags) -> Result<u32> {
        let rt = &self.runtime;
        let recording = rt.lock_state().is_recording();

        let mut requested: Vec<PipeId> = flags.request.into_iter().collect();
        if recording {
            requested.push(PipeId::GscVideo);
        }
        if rt.config.options.face_detection {
            requested.push(PipeId::Vra);
        }
        let route = rt.stream.route(&requested);

        let fcount = rt.context.next_fcount();
        let kind = if rt.output_pipe == self.first_pipe {
            FrameKind::Vision
        } else {
            FrameKind::Preview
        };
        let mut frame = Frame::new(fcount, u64::from(fcount), kind, &route);
        frame.set_hold_for_capture(flags.hold);
        if let Some(entity) = flags.skip.and_then(|pipe| frame.entity_mut(pipe)) {
            entity.transition(EntityState::FrameSkip)?;
        }
        let head = frame
            .entity_mut(self.first_pipe)
            .ok_or(PipelineError::PipeNotInGraph(self.first_pipe))?;
        if let Some(handle) = buffer.commit() {
            head.dst.attach_owned(handle);
        }

        let id = rt.arena.insert(frame);
        if let Err(e) = rt.inflight.insert(id) {
            rt.release(id, "in-flight insert");
            return Err(e);
        }
        if let Err(e) = rt.stream.push_frame_to_pipe(self.first_pipe, id) {
            if let Err(e) = rt.inflight.remove(id) {
                rt.context.list_error();
                warn!(%id, error = %e, "Unpushed frame was not tracked in flight");
            }
            rt.release(id, "stream push");
            return Err(e);
        }
        rt.context.frame_generated();
        trace!(fcount, hold = flags.hold, stages = route.len(), "Frame generated");
        Ok(fcount)
    }
}

// ===== Frame done =====

/// What the frame-done worker pulls out of a finished frame under one lock
#[derive(Debug)]
struct Finished {
    fcount: u32,
    outcome: FrameOutcome,
    timestamp_ns: u64,
    hold: bool,
    preview: Option<BufferHandle>,
    video: Option<BufferHandle>,
    faces: Option<u32>,
}

impl Finished {
    fn collect(frame: &mut Frame, output: PipeId, recording: bool) -> Self {
        let outcome = frame.outcome(output).unwrap_or(FrameOutcome::Failed);
        let preview = match outcome {
            FrameOutcome::Completed => frame.entity(output).and_then(|e| e.dst.handle().cloned()),
            _ => None,
        };
        let video = if recording && frame.entity_state(PipeId::GscVideo) == Some(EntityState::Complete) {
            frame.take_buffer(PipeId::GscVideo, false)
        } else {
            None
        };
        let faces = (frame.entity_state(PipeId::Vra) == Some(EntityState::Complete))
            .then_some(frame.meta.faces);
        Self {
            fcount: frame.fcount(),
            outcome,
            timestamp_ns: frame.meta.timestamp_ns,
            hold: frame.hold_for_capture(),
            preview,
            video,
            faces,
        }
    }
}

/// Handle one frame finishing its route through the stream graph
///
/// The popped id carries the reference the graph handed over; it is either
/// given to the hold list or released here.
pub fn handle_frame_done(rt: &Runtime, id: FrameId) -> LoopAction {
    if let Err(e) = rt.inflight.remove(id) {
        rt.context.list_error();
        warn!(error = %e, "Finished frame was not tracked in flight");
    }
    let recording = rt.lock_state().is_recording();
    let finished = match rt.arena.with_mut(id, |frame| Finished::collect(frame, rt.output_pipe, recording)) {
        Ok(finished) => finished,
        Err(e) => {
            warn!(%id, error = %e, "Finished frame vanished");
            return LoopAction::Continue;
        }
    };

    let total = rt.context.frame_finished(finished.outcome);
    if let Some(preview) = &finished.preview {
        if rt.context.frames().completed > u64::from(rt.config.initial_skip_frames) {
            rt.callbacks
                .on_preview_frame(&callback_buffer(preview, finished.fcount, finished.timestamp_ns));
            rt.context.preview_fired();
        } else {
            trace!(fcount = finished.fcount, "Preview frame skipped while settling");
        }
    }
    if let Some(buffer) = finished.video {
        rt.queues.recording.push(VideoJob {
            fcount: finished.fcount,
            timestamp_ns: finished.timestamp_ns,
            buffer,
        });
    }
    if let Some(faces) = finished.faces {
        rt.queues.faces.push(FaceEvent {
            fcount: finished.fcount,
            faces,
        });
    }
    if total % LOG_EVERY_N_FRAMES == 0 {
        let frames = rt.context.frames();
        info!(
            finished = total,
            completed = frames.completed,
            skipped = frames.skipped,
            errored = frames.errored,
            fps = format!("{:.1}", rt.context.preview_fps()),
            in_flight = rt.inflight.len(),
            held = rt.selector.len(),
            "Preview progress"
        );
    }

    if finished.hold && finished.outcome != FrameOutcome::Failed {
        park_for_capture(rt, id, finished.fcount);
    } else {
        if finished.hold {
            rt.context.hold_dropped();
        }
        rt.release(id, "frame done");
    }
    LoopAction::Continue
}

/// Return every buffer but the held one and hand the frame to the hold list
///
/// In dynamic modes a flagged frame finishing after its capture has ended
/// is released instead of held.
fn park_for_capture(rt: &Runtime, id: FrameId, fcount: u32) {
    let hold_pipe = rt.mode.hold_pipe();
    if let Err(e) = rt.arena.with_mut(id, |frame| frame.release_buffers_except(hold_pipe, false)) {
        rt.context.hold_dropped();
        rt.context.list_error();
        warn!(%id, error = %e, "Held frame vanished");
        return;
    }

    // Same lock order as the end of a capture: arming, then the hold lists
    let _arming = rt.lock_bayer();
    if rt.mode.is_dynamic() && !rt.capture_active() {
        debug!(fcount, pipe = %hold_pipe, "Capture already over, dropping late hold");
        rt.context.hold_dropped();
        rt.release(id, "late hold");
        return;
    }
    match rt.selector.manage_frame_hold_list(id, hold_pipe, false) {
        Ok(true) => trace!(fcount, pipe = %hold_pipe, "Frame held for capture"),
        Ok(false) => {
            rt.context.hold_dropped();
            debug!(fcount, pipe = %hold_pipe, "Frame not eligible for the hold list");
        }
        Err(e) => {
            rt.context.hold_dropped();
            rt.context.list_error();
            warn!(fcount, error = %e, "Hold list rejected frame");
            rt.release(id, "hold rejected");
        }
    }
}
