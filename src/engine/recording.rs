// SPDX-License-Identifier: GPL-3.0-only

//! Recording and face-metadata workers

use super::runtime::{FaceEvent, Runtime, VideoJob, callback_buffer};
use super::worker::LoopAction;
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

/// Deliver one recording-scaler output to the host
///
/// The first frames after recording starts are dropped while the encoder
/// settles.
pub fn handle_video(rt: &Runtime, job: VideoJob) -> LoopAction {
    let dropped = rt
        .recording_skip
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if dropped {
        debug!(fcount = job.fcount, "Video frame dropped after recording start");
        if let Err(e) = job.buffer.cancel() {
            warn!(error = %e, "Failed to return dropped video buffer");
        }
        return LoopAction::Continue;
    }

    let video = callback_buffer(&job.buffer, job.fcount, job.timestamp_ns);
    rt.callbacks.on_video_frame(&video, job.timestamp_ns);
    rt.context.video_fired();
    trace!(fcount = job.fcount, ts = job.timestamp_ns, "Video frame delivered");
    if let Err(e) = job.buffer.put() {
        warn!(fcount = job.fcount, error = %e, "Failed to return video buffer");
    }
    LoopAction::Continue
}

pub fn handle_faces(rt: &Runtime, event: FaceEvent) -> LoopAction {
    rt.callbacks.on_frame_metadata(event.fcount, event.faces);
    rt.context.metadata_fired();
    LoopAction::Continue
}
