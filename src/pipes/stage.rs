// SPDX-License-Identifier: GPL-3.0-only

//! Per-stage worker
//!
//! Each pipe pops frames from its input queue, binds buffers for its entity,
//! keeps up to `prepare` of them queued in the device and forwards every
//! finished frame to the next pipe of the frame's route.
//!
//! ```text
//!  input ──▶ accept ──▶ device ──▶ complete ──▶ Router ──▶ next pipe
//!              │                                   └────▶ output queue
//!              └── skip / upstream error ─────────────────▲
//! ```

use super::{FrameQueue, PipeId};
use crate::backends::{BackendError, DeviceBackend, DeviceBuffer, DeviceHandle, DeviceStatus, StageFormat};
use crate::buffers::{BufferPool, BufferState};
use crate::engine::worker::{LoopAction, WorkerController};
use crate::errors::{PipelineError, Result};
use crate::frame::{EntityState, Frame, FrameArena, FrameId};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Static description of one pipe
#[derive(Debug, Clone)]
pub struct PipeSetup {
    pub pipe: PipeId,
    /// Stage whose dst buffer this pipe reads
    pub source: Option<PipeId>,
    pub dst_pool: Option<Arc<BufferPool>>,
    pub format: StageFormat,
    /// Buffers kept queued in the device
    pub prepare: usize,
    pub queue_wait: Duration,
    pub dequeue_wait: Duration,
}

/// Health snapshot sampled by the watchdog
#[derive(Debug, Clone, Serialize)]
pub struct StageHealth {
    pub pipe: PipeId,
    pub running: bool,
    /// Frames queued in the device
    pub in_device: usize,
    pub queued: usize,
    pub completed: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Consecutive dequeue timeouts while the device held buffers
    pub dq_blocked: u32,
    pub since_progress: Duration,
    pub fault: Option<String>,
}

impl StageHealth {
    /// Device holds buffers the stage is waiting on
    pub fn is_busy(&self) -> bool {
        self.in_device > 0
    }
}

// ============================================================================
// Router
// ============================================================================

#[derive(Default)]
struct RouterInner {
    inputs: HashMap<PipeId, FrameQueue>,
    outputs: HashMap<PipeId, FrameQueue>,
}

/// Frame hand-off table between the pipes of a graph
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<Mutex<RouterInner>>,
}

impl Router {
    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_input(&self, pipe: PipeId, queue: FrameQueue) {
        self.lock().inputs.insert(pipe, queue);
    }

    /// Deliver frames finishing their route at `pipe` to `queue`
    pub fn set_output(&self, pipe: PipeId, queue: FrameQueue) {
        debug!(pipe = %pipe, queue = %queue.name(), "Output queue wired");
        self.lock().outputs.insert(pipe, queue);
    }

    pub fn clear_outputs(&self) {
        self.lock().outputs.clear();
    }

    /// Hand a frame on; `false` if nothing takes it
    pub fn dispatch(&self, from: PipeId, next: Option<PipeId>, id: FrameId) -> bool {
        let inner = self.lock();
        let target = match next {
            Some(next) => inner.inputs.get(&next),
            None => inner.outputs.get(&from),
        };
        match target {
            Some(queue) => {
                queue.push(id);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Router")
            .field("inputs", &inner.inputs.len())
            .field("outputs", &inner.outputs.len())
            .finish()
    }
}

// ============================================================================
// Pipe
// ============================================================================

struct HealthInner {
    completed: u64,
    skipped: u64,
    errors: u64,
    dq_blocked: u32,
    last_progress: Instant,
    fault: Option<String>,
}

enum Prepared {
    /// Queue this descriptor to the device
    Queue(DeviceBuffer),
    /// Entity is already terminal; hand the frame on
    Forward,
}

struct PipeCore {
    setup: PipeSetup,
    device: Arc<dyn DeviceBackend>,
    arena: Arc<FrameArena>,
    router: Router,
    input: FrameQueue,
    handle: Mutex<Option<DeviceHandle>>,
    in_device: Mutex<VecDeque<FrameId>>,
    health: Mutex<HealthInner>,
    streaming: AtomicBool,
}

/// One running stage of a pipe graph
pub struct Pipe {
    core: Arc<PipeCore>,
    worker: Mutex<Option<WorkerController>>,
}

impl Pipe {
    pub fn new(
        setup: PipeSetup,
        device: Arc<dyn DeviceBackend>,
        arena: Arc<FrameArena>,
        router: Router,
    ) -> Self {
        let input = FrameQueue::new(setup.pipe.name());
        router.register_input(setup.pipe, input.clone());
        Self {
            core: Arc::new(PipeCore {
                setup,
                device,
                arena,
                router,
                input,
                handle: Mutex::new(None),
                in_device: Mutex::new(VecDeque::new()),
                health: Mutex::new(HealthInner {
                    completed: 0,
                    skipped: 0,
                    errors: 0,
                    dq_blocked: 0,
                    last_progress: Instant::now(),
                    fault: None,
                }),
                streaming: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> PipeId {
        self.core.setup.pipe
    }

    pub fn setup(&self) -> &PipeSetup {
        &self.core.setup
    }

    pub fn input(&self) -> &FrameQueue {
        &self.core.input
    }

    pub fn is_open(&self) -> bool {
        self.core.device_handle().is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.core.streaming.load(Ordering::SeqCst)
    }

    /// Open and configure the device node
    pub fn open(&self) -> Result<()> {
        let core = &self.core;
        let mut handle = core.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return Ok(());
        }
        let pipe = core.setup.pipe;
        let opened = core.device.open(pipe).map_err(|e| stage_init(pipe, e))?;
        if let Err(e) = core.device.configure(opened, &core.setup.format) {
            let _ = core.device.close(opened);
            return Err(stage_init(pipe, e));
        }
        debug!(pipe = %pipe, format = %core.setup.format.format, size = %core.setup.format.size, "Pipe opened");
        *handle = Some(opened);
        Ok(())
    }

    /// Stream on and spawn the stage worker
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }
        let core = &self.core;
        let pipe = core.setup.pipe;
        let handle = core
            .device_handle()
            .ok_or_else(|| PipelineError::StageInit {
                pipe,
                reason: "device not opened".to_string(),
            })?;
        core.device
            .stream_on(handle)
            .map_err(|e| stage_init(pipe, e))?;
        core.streaming.store(true, Ordering::SeqCst);
        core.reset_health();

        let loop_core = Arc::clone(core);
        let spawned = WorkerController::start(&format!("pipe-{}", pipe.name().to_lowercase()), move || {
            loop_core.run_once()
        });
        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                core.streaming.store(false, Ordering::SeqCst);
                let _ = core.device.stream_off(handle);
                return Err(e);
            }
        };
        let waker = core.input.clone();
        *worker = Some(spawned.with_waker(move || waker.wake_up()));
        info!(pipe = %pipe, prepare = core.setup.prepare, "Pipe started");
        Ok(())
    }

    /// Stop the worker and stream off
    ///
    /// Returns every frame the pipe still carried, queued or in the device.
    /// The caller owns those references. Safe to call repeatedly.
    pub fn stop(&self) -> Vec<FrameId> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut worker) = worker {
            worker.stop();
        }

        let core = &self.core;
        if core.streaming.swap(false, Ordering::SeqCst) {
            if let Some(handle) = core.device_handle() {
                if let Err(e) = core.device.stream_off(handle) {
                    warn!(pipe = %core.setup.pipe, error = %e, "Stream off failed");
                }
            }
        }

        let mut drained: Vec<FrameId> = core.lock_in_device().drain(..).collect();
        drained.extend(core.input.drain());
        if !drained.is_empty() {
            debug!(pipe = %core.setup.pipe, frames = drained.len(), "Drained pipe");
        }
        drained
    }

    /// Release the device node
    pub fn close(&self) {
        let core = &self.core;
        let handle = core.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = core.device.close(handle) {
                warn!(pipe = %core.setup.pipe, error = %e, "Close failed");
            }
        }
    }

    pub fn push(&self, id: FrameId) {
        self.core.input.push(id);
    }

    pub fn health(&self) -> StageHealth {
        let core = &self.core;
        let in_device = core.lock_in_device().len();
        let health = core.lock_health();
        StageHealth {
            pipe: core.setup.pipe,
            running: self.is_streaming(),
            in_device,
            queued: core.input.len(),
            completed: health.completed,
            skipped: health.skipped,
            errors: health.errors,
            dq_blocked: health.dq_blocked,
            since_progress: health.last_progress.elapsed(),
            fault: health.fault.clone(),
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let leftover = self.stop();
        if !leftover.is_empty() {
            warn!(pipe = %self.id(), frames = leftover.len(), "Pipe dropped while carrying frames");
            for id in leftover {
                if let Err(e) = self.core.arena.release(id) {
                    warn!(pipe = %self.id(), %id, error = %e, "Leftover frame release failed");
                }
            }
        }
        self.close();
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("pipe", &self.id())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

fn stage_init(pipe: PipeId, err: BackendError) -> PipelineError {
    match err {
        BackendError::Unrecoverable(reason) => PipelineError::UnrecoverableDevice { pipe, reason },
        other => PipelineError::StageInit {
            pipe,
            reason: other.to_string(),
        },
    }
}

impl PipeCore {
    fn device_handle(&self) -> Option<DeviceHandle> {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_in_device(&self) -> MutexGuard<'_, VecDeque<FrameId>> {
        self.in_device.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_health(&self) -> MutexGuard<'_, HealthInner> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reset_health(&self) {
        let mut health = self.lock_health();
        health.dq_blocked = 0;
        health.last_progress = Instant::now();
        health.fault = None;
    }

    fn run_once(&self) -> LoopAction {
        let Some(handle) = self.device_handle() else {
            return LoopAction::Stop;
        };

        // Top the device up to the prepare depth
        loop {
            let depth = self.lock_in_device().len();
            if depth >= self.setup.prepare {
                break;
            }
            let next = if depth == 0 {
                match self.input.wait_and_pop(self.setup.queue_wait) {
                    super::Popped::Item(id) => Some(id),
                    _ => return LoopAction::Continue,
                }
            } else {
                self.input.try_pop()
            };
            match next {
                Some(id) => self.accept(handle, id),
                None => break,
            }
        }

        if self.lock_in_device().is_empty() {
            return LoopAction::Continue;
        }
        self.poll_device(handle);
        LoopAction::Continue
    }

    fn accept(&self, handle: DeviceHandle, id: FrameId) {
        let prepared = self.arena.with_mut(id, |frame| self.prepare_entity(id, frame));
        match prepared {
            Ok(Prepared::Queue(buffer)) => {
                let fcount = buffer.fcount;
                match self.device.enqueue(handle, buffer) {
                    Ok(()) => {
                        trace!(pipe = %self.setup.pipe, fcount, "Queued to device");
                        self.lock_in_device().push_back(id);
                    }
                    Err(e) => {
                        warn!(pipe = %self.setup.pipe, fcount, error = %e, "Enqueue failed");
                        self.fail_entity(id);
                        self.forward(id);
                    }
                }
            }
            Ok(Prepared::Forward) => self.forward(id),
            Err(e) => {
                warn!(pipe = %self.setup.pipe, %id, error = %e, "Dropping unknown frame");
            }
        }
    }

    /// Bind buffers and move the entity to PROCESSING
    fn prepare_entity(&self, id: FrameId, frame: &mut Frame) -> Prepared {
        let pipe = self.setup.pipe;
        let fcount = frame.fcount();
        let upstream = self
            .setup
            .source
            .and_then(|src| frame.entity(src))
            .map(|e| (e.state(), e.dst.handle().or(e.src.handle()).cloned()));

        let Some(entity) = frame.entity_mut(pipe) else {
            warn!(
                error = %PipelineError::NoEntity { frame: id, pipe },
                "Frame routed to a pipe it does not visit"
            );
            return Prepared::Forward;
        };
        if entity.state() != EntityState::Requested {
            debug!(pipe = %pipe, fcount, state = ?entity.state(), "Entity already settled");
            return Prepared::Forward;
        }

        if entity.src.handle().is_none() {
            match upstream {
                Some((EntityState::FrameSkip, _)) => {
                    let _ = entity.transition(EntityState::FrameSkip);
                    self.lock_health().skipped += 1;
                    return Prepared::Forward;
                }
                Some((EntityState::Error, _)) => {
                    let _ = entity.transition(EntityState::Error);
                    return Prepared::Forward;
                }
                Some((_, Some(handle))) => entity.src.attach_borrowed(handle),
                _ => {}
            }
        }

        if let Some(pool) = &self.setup.dst_pool {
            if entity.dst.handle().is_none() {
                match pool.get() {
                    Ok(handle) => entity.dst.attach_owned(handle),
                    Err(e) if e.is_transient() => {
                        debug!(pipe = %pipe, fcount, error = %e, "No dst buffer, skipping frame");
                        let _ = entity.transition(EntityState::FrameSkip);
                        self.lock_health().skipped += 1;
                        return Prepared::Forward;
                    }
                    Err(e) => {
                        warn!(pipe = %pipe, fcount, error = %e, "Dst buffer unavailable");
                        let _ = entity.transition(EntityState::Error);
                        self.lock_health().errors += 1;
                        return Prepared::Forward;
                    }
                }
            }
        }

        if let Err(e) = entity.transition(EntityState::Processing) {
            warn!(pipe = %pipe, fcount, error = %e, "Cannot start entity");
            return Prepared::Forward;
        }
        if let Some(handle) = entity.dst.handle() {
            let _ = handle.mark(BufferState::Requested);
        }
        Prepared::Queue(DeviceBuffer::new(entity.dst.index(), fcount))
    }

    fn poll_device(&self, handle: DeviceHandle) {
        match self.device.dequeue(handle, self.setup.dequeue_wait) {
            Ok(Some(buffer)) => {
                let front = self.lock_in_device().pop_front();
                let Some(id) = front else {
                    warn!(pipe = %self.setup.pipe, fcount = buffer.fcount, "Completion with nothing in flight");
                    return;
                };
                self.complete(id, buffer);
                let mut health = self.lock_health();
                health.dq_blocked = 0;
                health.last_progress = Instant::now();
            }
            Ok(None) => {
                let mut health = self.lock_health();
                health.dq_blocked += 1;
                trace!(pipe = %self.setup.pipe, blocked = health.dq_blocked, "Dequeue timed out");
            }
            Err(BackendError::Unrecoverable(reason)) => {
                error!(pipe = %self.setup.pipe, reason = %reason, "Unrecoverable stage fault");
                self.lock_health().fault = Some(reason);
                std::thread::sleep(self.setup.queue_wait);
            }
            Err(e) => {
                warn!(pipe = %self.setup.pipe, error = %e, "Dequeue failed");
                self.lock_health().dq_blocked += 1;
            }
        }
    }

    fn complete(&self, id: FrameId, buffer: DeviceBuffer) {
        let pipe = self.setup.pipe;
        let done = buffer.status == DeviceStatus::Done;
        let result = self.arena.with_mut(id, |frame| -> Result<()> {
            if frame.fcount() != buffer.fcount {
                warn!(
                    pipe = %pipe,
                    expected = frame.fcount(),
                    got = buffer.fcount,
                    "Device completed out of order"
                );
            }
            let reworked = frame.take_rework(pipe);
            let entity = frame
                .entity_mut(pipe)
                .ok_or(PipelineError::NoEntity { frame: id, pipe })?;
            if reworked {
                entity.transition(EntityState::Rework)?;
                entity.transition(EntityState::Processing)?;
            }
            let (next, mark) = if done {
                (EntityState::Complete, BufferState::Complete)
            } else {
                (EntityState::Error, BufferState::Error)
            };
            entity.transition(next)?;
            if let Some(handle) = entity.dst.handle() {
                let _ = handle.mark(mark);
            }
            if reworked {
                debug!(pipe = %pipe, fcount = frame.fcount(), "Entity reworked for capture hold");
                frame.set_hold_for_capture(true);
            }
            if done {
                if frame.meta.timestamp_ns == 0 {
                    frame.meta.timestamp_ns = buffer.timestamp_ns;
                }
                frame.meta.af = buffer.af;
                if pipe == PipeId::Vra {
                    frame.meta.faces = buffer.faces;
                }
            }
            Ok(())
        });

        match result {
            Ok(Ok(())) => {
                let mut health = self.lock_health();
                if done {
                    health.completed += 1;
                } else {
                    health.errors += 1;
                }
            }
            Ok(Err(e)) => warn!(pipe = %pipe, %id, error = %e, "Completion rejected"),
            Err(e) => warn!(pipe = %pipe, %id, error = %e, "Completed frame vanished"),
        }
        self.forward(id);
    }

    fn fail_entity(&self, id: FrameId) {
        let pipe = self.setup.pipe;
        let _ = self.arena.with_mut(id, |frame| {
            if let Some(entity) = frame.entity_mut(pipe) {
                entity.abort();
            }
        });
        self.lock_health().errors += 1;
    }

    fn forward(&self, id: FrameId) {
        let pipe = self.setup.pipe;
        let next = self
            .arena
            .with(id, |frame| frame.next_pipe_after(pipe))
            .ok()
            .flatten();
        if !self.router.dispatch(pipe, next, id) {
            debug!(pipe = %pipe, %id, "Frame has no consumer, releasing");
            if let Err(e) = self.arena.release(id) {
                warn!(pipe = %pipe, %id, error = %e, "Release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{HeapMemory, PixelFormat, Size, VirtualDevice};
    use crate::buffers::AllocMode;
    use crate::frame::FrameKind;
    use crate::pipes::Popped;

    struct Fixture {
        device: Arc<VirtualDevice>,
        arena: Arc<FrameArena>,
        router: Router,
        pool: Arc<BufferPool>,
        done: FrameQueue,
    }

    fn fixture(count: usize) -> Fixture {
        let pool = BufferPool::new("scaler", Arc::new(HeapMemory::new()));
        pool.alloc(&[64, 64], count, count, AllocMode::AtOnce).unwrap();
        Fixture {
            device: Arc::new(VirtualDevice::new()),
            arena: FrameArena::new(),
            router: Router::default(),
            pool,
            done: FrameQueue::new("done"),
        }
    }

    fn setup(pipe: PipeId, pool: Option<Arc<BufferPool>>) -> PipeSetup {
        PipeSetup {
            pipe,
            source: None,
            dst_pool: pool,
            format: StageFormat {
                format: PixelFormat::Nv21,
                size: Size::new(8, 8),
            },
            prepare: 2,
            queue_wait: Duration::from_millis(10),
            dequeue_wait: Duration::from_millis(20),
        }
    }

    fn wait_done(queue: &FrameQueue, count: usize) -> Vec<FrameId> {
        let mut ids = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ids.len() < count && Instant::now() < deadline {
            if let Popped::Item(id) = queue.wait_and_pop(Duration::from_millis(50)) {
                ids.push(id);
            }
        }
        ids
    }

    #[test]
    fn test_frames_complete_in_order() {
        let f = fixture(4);
        let pipe = Pipe::new(
            setup(PipeId::Scp, Some(f.pool.clone())),
            f.device.clone(),
            f.arena.clone(),
            f.router.clone(),
        );
        f.router.set_output(PipeId::Scp, f.done.clone());
        pipe.open().unwrap();
        pipe.start().unwrap();

        let ids: Vec<FrameId> = (1..=3)
            .map(|n| f.arena.insert(Frame::new(n, n as u64, FrameKind::Preview, &[PipeId::Scp])))
            .collect();
        for &id in &ids {
            pipe.push(id);
        }

        let done = wait_done(&f.done, 3);
        assert_eq!(done, ids);
        for id in done {
            assert_eq!(
                f.arena.with(id, |fr| fr.entity_state(PipeId::Scp)).unwrap(),
                Some(EntityState::Complete)
            );
            f.arena.release(id).unwrap();
        }
        assert!(pipe.stop().is_empty());
        assert_eq!(f.pool.available(), 4);
        assert_eq!(pipe.health().completed, 3);
    }

    #[test]
    fn test_exhausted_pool_skips() {
        let f = fixture(2);
        f.pool.inject_exhaustion(1);
        let pipe = Pipe::new(
            setup(PipeId::Scp, Some(f.pool.clone())),
            f.device.clone(),
            f.arena.clone(),
            f.router.clone(),
        );
        f.router.set_output(PipeId::Scp, f.done.clone());
        pipe.open().unwrap();
        pipe.start().unwrap();

        let id = f.arena.insert(Frame::new(1, 1, FrameKind::Preview, &[PipeId::Scp]));
        pipe.push(id);
        let done = wait_done(&f.done, 1);
        assert_eq!(done, vec![id]);
        assert_eq!(
            f.arena.with(id, |fr| fr.entity_state(PipeId::Scp)).unwrap(),
            Some(EntityState::FrameSkip)
        );
        f.arena.release(id).unwrap();
        pipe.stop();
        assert_eq!(pipe.health().skipped, 1);
    }

    #[test]
    fn test_open_failure_is_stage_init() {
        let f = fixture(1);
        f.device.fail_open(PipeId::Isp);
        let pipe = Pipe::new(setup(PipeId::Isp, None), f.device.clone(), f.arena.clone(), f.router.clone());
        assert!(matches!(pipe.open(), Err(PipelineError::StageInit { .. })));
        assert!(!pipe.is_open());
    }

    #[test]
    fn test_stop_drains_in_device_frames() {
        let f = fixture(4);
        f.device.stall(PipeId::Scp);
        let pipe = Pipe::new(
            setup(PipeId::Scp, Some(f.pool.clone())),
            f.device.clone(),
            f.arena.clone(),
            f.router.clone(),
        );
        pipe.open().unwrap();
        pipe.start().unwrap();

        let ids: Vec<FrameId> = (1..=3)
            .map(|n| f.arena.insert(Frame::new(n, n as u64, FrameKind::Preview, &[PipeId::Scp])))
            .collect();
        for &id in &ids {
            pipe.push(id);
        }
        std::thread::sleep(Duration::from_millis(100));

        let mut drained = pipe.stop();
        drained.sort_by_key(|id| id.index());
        assert_eq!(drained, ids);
        for id in drained {
            f.arena.with_mut(id, |fr| fr.abort()).unwrap();
            assert!(f.arena.release(id).unwrap());
        }
        assert_eq!(f.arena.stats().forced, 0);
        assert_eq!(f.pool.available(), 4);
        assert!(pipe.stop().is_empty());
    }

    #[test]
    fn test_source_skip_propagates() {
        let f = fixture(2);
        let mut downstream = setup(PipeId::Jpeg, Some(f.pool.clone()));
        downstream.source = Some(PipeId::Scc);
        let pipe = Pipe::new(downstream, f.device.clone(), f.arena.clone(), f.router.clone());
        f.router.set_output(PipeId::Jpeg, f.done.clone());
        pipe.open().unwrap();
        pipe.start().unwrap();

        let id = f.arena.insert(Frame::new(1, 1, FrameKind::Preview, &[PipeId::Scc, PipeId::Jpeg]));
        f.arena
            .with_mut(id, |fr| fr.set_entity_state(id, PipeId::Scc, EntityState::FrameSkip))
            .unwrap()
            .unwrap();
        pipe.push(id);

        assert_eq!(wait_done(&f.done, 1), vec![id]);
        assert_eq!(
            f.arena.with(id, |fr| fr.entity_state(PipeId::Jpeg)).unwrap(),
            Some(EntityState::FrameSkip)
        );
        assert_eq!(f.pool.available(), 2);
        f.arena.release(id).unwrap();
        pipe.stop();
    }
}
