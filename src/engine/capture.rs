// SPDX-License-Identifier: GPL-3.0-only

//! Still capture workers
//!
//! ```text
//! take_picture ─▶ shutter ─▶ picture ──select──▶ reprocessing graph / JPEG stage
//!                                                        │
//!                    on_picture_done ◀── save ×N ◀── post_picture
//! ```
//!
//! Every shot ends in exactly one `shot_finished` call, delivered or not;
//! the runtime closes the sequence once the picture worker is done selecting
//! and every shot has ended.

use super::runtime::{CaptureRequest, Runtime, SaveJob, callback_buffer};
use super::worker::LoopAction;
use crate::errors::{PipelineError, Result};
use crate::frame::{Frame, FrameId, FrameKind, FrameOutcome};
use crate::pipes::PipeId;
use crate::selector::SelectedFrame;
use tracing::{debug, info, warn};

/// Fire the shutter notification and hand the request to the picture worker
pub fn handle_shutter(rt: &Runtime, request: CaptureRequest) -> LoopAction {
    rt.callbacks.on_shutter();
    rt.context.shutter_fired();
    debug!(seq = request.seq, shots = request.shots, "Shutter fired");
    rt.queues.picture.push(request);
    LoopAction::Continue
}

/// Select one held frame per shot and submit it to the encode path
pub fn handle_picture(rt: &Runtime, request: CaptureRequest) -> LoopAction {
    let hold_pipe = rt.mode.hold_pipe();
    let policy = rt.selector.policy();
    let retries = if rt.mode.is_dynamic() {
        // Armed frames are still in flight; only the hold wait bounds the selection
        u32::MAX
    } else {
        policy.retries(&rt.config.timing)
    };
    info!(seq = request.seq, shots = request.shots, policy = %policy, "Picture selection started");

    for shot in 0..request.shots {
        if rt.is_stopping() {
            break;
        }
        match rt.selector.select_frames(shot, hold_pipe, false, retries) {
            Ok(selected) => match submit_shot(rt, &request, selected) {
                Ok(id) => {
                    debug!(seq = request.seq, shot, %id, "Shot submitted");
                    rt.shot_submitted(request.seq);
                }
                Err(e) => {
                    warn!(seq = request.seq, shot, error = %e, "Shot could not be submitted");
                    rt.shot_finished(request.seq, false);
                }
            },
            Err(PipelineError::CaptureCancelled) => {
                rt.capture_cancelled(request.seq);
                return LoopAction::Continue;
            }
            Err(e) => {
                if matches!(e, PipelineError::SelectionTimeout { .. }) {
                    rt.context.selection_timed_out();
                }
                warn!(seq = request.seq, shot, error = %e, "No frame for shot");
                rt.shot_finished(request.seq, false);
            }
        }
    }
    rt.selection_finished(request.seq);
    LoopAction::Continue
}

/// Build the encode frame around the selected buffer and push it
///
/// With reprocessing the held bayer buffer becomes the source of the
/// reprocessing graph; otherwise the held SCC output goes straight to the
/// stream graph's JPEG stage.
fn submit_shot(rt: &Runtime, request: &CaptureRequest, selected: SelectedFrame) -> Result<FrameId> {
    let meta = selected.with(|frame| frame.meta)?;
    let (graph, kind, route) = match &rt.reprocessing {
        Some(graph) => (graph, FrameKind::Reprocessing, graph.route(&[])),
        None => (&rt.stream, FrameKind::Picture, vec![PipeId::Jpeg]),
    };
    let first = route
        .first()
        .copied()
        .ok_or_else(|| PipelineError::Config(format!("{} graph has no stages", graph.name())))?;
    let buffer = selected.take_buffer().ok_or(PipelineError::NoEntity {
        frame: selected.id(),
        pipe: rt.mode.hold_pipe(),
    })?;

    let mut frame = Frame::new(selected.fcount(), request.seq, kind, &route);
    frame.meta = meta;
    match frame.entity_mut(first) {
        Some(entity) => entity.src.attach_owned(buffer),
        None => {
            if let Err(e) = buffer.cancel() {
                warn!(pipe = %first, error = %e, "Reprocessing source could not be returned");
            }
            return Err(PipelineError::PipeNotInGraph(first));
        }
    }
    drop(selected);

    let id = rt.arena.insert(frame);
    if let Err(e) = graph.push_frame_to_pipe(first, id) {
        rt.release(id, "picture push");
        return Err(e);
    }
    Ok(id)
}

/// Take the encoded output off a finished picture frame
pub fn handle_post_picture(rt: &Runtime, id: FrameId) -> LoopAction {
    let extracted = rt.arena.with_mut(id, |frame| {
        let output = frame.route().last().copied();
        let buffer = output
            .filter(|&pipe| frame.outcome(pipe) == Some(FrameOutcome::Completed))
            .and_then(|pipe| frame.take_buffer(pipe, false));
        (frame.request_key(), frame.fcount(), frame.meta.timestamp_ns, buffer)
    });
    match extracted {
        Ok((seq, fcount, timestamp_ns, Some(buffer))) => {
            debug!(seq, fcount, "Picture encoded");
            rt.queues.save.push(SaveJob {
                seq,
                fcount,
                timestamp_ns,
                buffer,
            });
        }
        Ok((seq, fcount, _, None)) => {
            warn!(seq, fcount, "Picture frame produced no output");
            rt.shot_finished(seq, false);
        }
        Err(e) => warn!(%id, error = %e, "Picture frame vanished"),
    }
    rt.release(id, "post picture");
    LoopAction::Continue
}

/// Hand a finished picture to the host
pub fn handle_save(rt: &Runtime, job: SaveJob) -> LoopAction {
    let picture = callback_buffer(&job.buffer, job.fcount, job.timestamp_ns);
    rt.callbacks.on_picture_done(&picture);
    rt.context.picture_fired();
    info!(seq = job.seq, fcount = job.fcount, bytes = picture.len(), "Picture delivered");
    if let Err(e) = job.buffer.put() {
        warn!(seq = job.seq, error = %e, "Failed to return picture buffer");
    }
    rt.shot_finished(job.seq, true);
    LoopAction::Continue
}
