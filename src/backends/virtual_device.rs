// SPDX-License-Identifier: GPL-3.0-only

//! Simulated stage devices
//!
//! Every opened pipe gets a node with a FIFO of queued buffers. A buffer
//! becomes dequeueable once the per-stage latency has elapsed. Faults can be
//! injected per pipe to exercise the engine's error paths without hardware.

use super::device::{DeviceBackend, DeviceBuffer, DeviceHandle, DeviceStatus};
use super::types::{AfState, BackendError, BackendResult, StageFormat};
use crate::pipes::PipeId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
struct StageBehavior {
    fail_open: bool,
    fail_configure: bool,
    fail_stream_on: bool,
    dequeue_errors: u32,
    unrecoverable: bool,
    stalled: bool,
    latency: Duration,
    opens: u32,
    stream_ons: u32,
    processed: u64,
}

struct Pending {
    buffer: DeviceBuffer,
    ready_at: Instant,
}

struct Node {
    pipe: PipeId,
    format: Option<StageFormat>,
    streaming: bool,
    queue: VecDeque<Pending>,
}

#[derive(Default)]
struct VirtualState {
    next_handle: u32,
    nodes: HashMap<DeviceHandle, Node>,
    stages: HashMap<PipeId, StageBehavior>,
    faces: u32,
    af: AfState,
}

/// Simulated hardware for every pipe of the capture graph
pub struct VirtualDevice {
    state: Mutex<VirtualState>,
    cond: Condvar,
    epoch: Instant,
}

impl VirtualDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VirtualState::default()),
            cond: Condvar::new(),
            epoch: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_stage<R>(&self, pipe: PipeId, f: impl FnOnce(&mut StageBehavior) -> R) -> R {
        let mut state = self.lock();
        let result = f(state.stages.entry(pipe).or_default());
        drop(state);
        self.cond.notify_all();
        result
    }

    // ===== Fault injection =====

    /// Make `open` fail for a pipe
    pub fn fail_open(&self, pipe: PipeId) {
        self.with_stage(pipe, |s| s.fail_open = true);
    }

    pub fn fail_configure(&self, pipe: PipeId) {
        self.with_stage(pipe, |s| s.fail_configure = true);
    }

    pub fn fail_stream_on(&self, pipe: PipeId) {
        self.with_stage(pipe, |s| s.fail_stream_on = true);
    }

    /// Complete the next `count` buffers of a pipe with an error status
    pub fn inject_dequeue_errors(&self, pipe: PipeId, count: u32) {
        self.with_stage(pipe, |s| s.dequeue_errors += count);
    }

    /// Report an unrecoverable fault on every dequeue of a streaming pipe
    pub fn set_unrecoverable(&self, pipe: PipeId) {
        warn!(pipe = %pipe, "Injecting unrecoverable stage fault");
        self.with_stage(pipe, |s| s.unrecoverable = true);
    }

    /// Stop completing buffers for a pipe until `resume`
    pub fn stall(&self, pipe: PipeId) {
        self.with_stage(pipe, |s| s.stalled = true);
    }

    pub fn resume(&self, pipe: PipeId) {
        self.with_stage(pipe, |s| s.stalled = false);
    }

    /// Processing time of a pipe
    pub fn set_latency(&self, pipe: PipeId, latency: Duration) {
        self.with_stage(pipe, |s| s.latency = latency);
    }

    /// Face count reported on every completion
    pub fn set_faces(&self, faces: u32) {
        self.lock().faces = faces;
    }

    /// AF state reported on every completion
    pub fn set_af_state(&self, af: AfState) {
        self.lock().af = af;
    }

    // ===== Inspection =====

    pub fn open_count(&self, pipe: PipeId) -> u32 {
        self.lock().stages.get(&pipe).map(|s| s.opens).unwrap_or(0)
    }

    pub fn stream_on_count(&self, pipe: PipeId) -> u32 {
        self.lock().stages.get(&pipe).map(|s| s.stream_ons).unwrap_or(0)
    }

    /// Buffers a pipe has completed so far
    pub fn processed(&self, pipe: PipeId) -> u64 {
        self.lock().stages.get(&pipe).map(|s| s.processed).unwrap_or(0)
    }

    pub fn is_streaming(&self, pipe: PipeId) -> bool {
        self.lock()
            .nodes
            .values()
            .any(|n| n.pipe == pipe && n.streaming)
    }

    /// Number of device nodes currently open
    pub fn open_devices(&self) -> usize {
        self.lock().nodes.len()
    }

    fn node_pipe(state: &VirtualState, handle: DeviceHandle) -> BackendResult<PipeId> {
        state
            .nodes
            .get(&handle)
            .map(|n| n.pipe)
            .ok_or_else(|| BackendError::InvalidHandle(handle.to_string()))
    }
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for VirtualDevice {
    fn open(&self, pipe: PipeId) -> BackendResult<DeviceHandle> {
        let mut state = self.lock();
        let stage = state.stages.entry(pipe).or_default();
        if stage.fail_open {
            return Err(BackendError::OpenFailed(format!("{} node busy", pipe)));
        }
        stage.opens += 1;

        state.next_handle += 1;
        let handle = DeviceHandle(state.next_handle);
        state.nodes.insert(
            handle,
            Node {
                pipe,
                format: None,
                streaming: false,
                queue: VecDeque::new(),
            },
        );
        debug!(pipe = %pipe, handle = %handle, "Opened virtual stage");
        Ok(handle)
    }

    fn configure(&self, handle: DeviceHandle, format: &StageFormat) -> BackendResult<()> {
        let mut state = self.lock();
        let pipe = Self::node_pipe(&state, handle)?;
        if state.stages.get(&pipe).is_some_and(|s| s.fail_configure) {
            return Err(BackendError::OpenFailed(format!(
                "{} rejected format {}",
                pipe, format
            )));
        }
        if let Some(node) = state.nodes.get_mut(&handle) {
            node.format = Some(*format);
        }
        Ok(())
    }

    fn close(&self, handle: DeviceHandle) -> BackendResult<()> {
        let mut state = self.lock();
        match state.nodes.remove(&handle) {
            Some(node) => {
                debug!(pipe = %node.pipe, handle = %handle, "Closed virtual stage");
                Ok(())
            }
            None => Err(BackendError::InvalidHandle(handle.to_string())),
        }
    }

    fn stream_on(&self, handle: DeviceHandle) -> BackendResult<()> {
        let mut state = self.lock();
        let pipe = Self::node_pipe(&state, handle)?;
        let stage = state.stages.entry(pipe).or_default();
        if stage.fail_stream_on {
            return Err(BackendError::Io(format!("{} stream on refused", pipe)));
        }
        stage.stream_ons += 1;
        if let Some(node) = state.nodes.get_mut(&handle) {
            if node.format.is_none() {
                return Err(BackendError::Io(format!("{} not configured", pipe)));
            }
            node.streaming = true;
        }
        info!(pipe = %pipe, "Virtual stage streaming");
        Ok(())
    }

    fn stream_off(&self, handle: DeviceHandle) -> BackendResult<()> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| BackendError::InvalidHandle(handle.to_string()))?;
        node.streaming = false;
        let flushed = node.queue.len();
        node.queue.clear();
        debug!(pipe = %node.pipe, flushed, "Virtual stage stream off");
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn enqueue(&self, handle: DeviceHandle, buffer: DeviceBuffer) -> BackendResult<()> {
        let mut state = self.lock();
        let pipe = Self::node_pipe(&state, handle)?;
        let latency = state
            .stages
            .get(&pipe)
            .map(|s| s.latency)
            .unwrap_or_default();
        let node = state
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| BackendError::InvalidHandle(handle.to_string()))?;
        if !node.streaming {
            return Err(BackendError::Io(format!("{} not streaming", pipe)));
        }
        node.queue.push_back(Pending {
            buffer,
            ready_at: Instant::now() + latency,
        });
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn dequeue(
        &self,
        handle: DeviceHandle,
        timeout: Duration,
    ) -> BackendResult<Option<DeviceBuffer>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            let now = Instant::now();
            let node = state
                .nodes
                .get(&handle)
                .ok_or_else(|| BackendError::InvalidHandle(handle.to_string()))?;
            let pipe = node.pipe;
            let streaming = node.streaming;
            let front_ready = node.queue.front().map(|p| p.ready_at);
            let behavior = state.stages.get(&pipe).cloned().unwrap_or_default();

            if streaming && behavior.unrecoverable {
                return Err(BackendError::Unrecoverable(format!(
                    "{} sensor timeout",
                    pipe
                )));
            }

            let producing = streaming && !behavior.stalled;
            if producing && front_ready.is_some_and(|ready_at| ready_at <= now) {
                let pending = state.nodes.get_mut(&handle).and_then(|n| n.queue.pop_front());
                if let Some(pending) = pending {
                    let faces = state.faces;
                    let af = state.af;
                    let stage = state.stages.entry(pipe).or_default();
                    stage.processed += 1;

                    let mut buffer = pending.buffer;
                    buffer.status = if stage.dequeue_errors > 0 {
                        stage.dequeue_errors -= 1;
                        DeviceStatus::Error
                    } else {
                        DeviceStatus::Done
                    };
                    buffer.timestamp_ns = now.duration_since(self.epoch).as_nanos() as u64;
                    buffer.faces = faces;
                    buffer.af = af;
                    return Ok(Some(buffer));
                }
            }

            if now >= deadline {
                return Ok(None);
            }

            let mut wait = deadline - now;
            if let Some(ready_at) = front_ready.filter(|_| producing) {
                if ready_at > now {
                    wait = wait.min(ready_at - now);
                }
            }
            state = match self.cond.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
