// SPDX-License-Identifier: GPL-3.0-only

//! Capture session orchestrator
//!
//! A [`CaptureSession`] owns the frame arena and buffer pools for its whole
//! lifetime. Each preview run resolves its pipe graphs, wires their outputs
//! into the worker queues and starts the workers; stopping tears all of that
//! down again in a fixed order so every frame and buffer is accounted for.
//!
//! ```text
//! start_preview ─▶ resolve graphs ─▶ wire outputs ─▶ start graphs ─▶ workers
//! stop_preview  ─▶ feeder ─▶ graphs ─▶ workers ─▶ queues ─▶ lists ─▶ pools
//! ```

pub mod bayer;
pub mod capture;
pub mod context;
pub mod inflight;
pub mod preview;
pub mod recording;
pub mod runtime;
pub mod state;
pub mod watchdog;
pub mod worker;

pub use bayer::{BayerArming, GenerationFlags, ReprocessingBayerMode};
pub use context::{CallbackCounters, ContextSnapshot, FrameCounters, SessionContext};
pub use state::{SessionState, SessionStateMachine};
pub use worker::{LoopAction, WorkerController, WorkerSet};

use crate::backends::{DeviceBackend, HostCallbacks, MemoryBackend};
use crate::buffers::{BufferPool, BufferPools, PoolRole, PoolStats};
use crate::config::CaptureConfig;
use crate::errors::{PipelineError, Result};
use crate::factory::{FactoryKind, GraphTable, PipeGraph};
use crate::frame::{ArenaStats, FrameArena, FrameId};
use crate::pipes::{FrameQueue, PipeId, StageHealth};
use crate::selector::{CaptureIntent, SelectionPolicy, SelectorStats};
use preview::Feeder;
use runtime::{CaptureRequest, Runtime, RuntimeParts};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll interval of the `wait_until` helper
const WAIT_POLL: Duration = Duration::from_millis(5);

/// What a preview stop had to clean up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Frames the stopped stages still carried
    pub drained: usize,
    /// Frames forced to a terminal state because the stop cut them off
    pub aborted: usize,
    /// Items left in worker queues
    pub queued: usize,
    /// In-flight entries released
    pub in_flight: usize,
    /// Frames still alive after everything released its references
    pub purged: usize,
    /// Buffers still checked out when the pools were released
    pub leaked_buffers: usize,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.purged == 0 && self.leaked_buffers == 0
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: SessionState,
    pub mode: ReprocessingBayerMode,
    pub context: ContextSnapshot,
    pub arena: ArenaStats,
    pub pools: BTreeMap<PoolRole, PoolStats>,
    pub selector: SelectorStats,
    pub in_flight: usize,
    pub held: usize,
}

/// Threads and graphs of one preview run
struct Run {
    runtime: Arc<Runtime>,
    table: GraphTable,
    feeder: WorkerController,
    watchdog: WorkerController,
    workers: WorkerSet,
}

/// Camera capture session
pub struct CaptureSession {
    device: Arc<dyn DeviceBackend>,
    callbacks: Arc<dyn HostCallbacks>,
    config: Mutex<CaptureConfig>,
    arena: Arc<FrameArena>,
    pools: Arc<BufferPools>,
    state: Arc<Mutex<SessionStateMachine>>,
    context: Mutex<Arc<SessionContext>>,
    frame_limit: Arc<AtomicU64>,
    /// Shared state of the active run, for calls that must not wait on a stop
    active: Mutex<Option<Arc<Runtime>>>,
    run: Mutex<Option<Run>>,
}

impl CaptureSession {
    pub fn new(
        device: Arc<dyn DeviceBackend>,
        memory: Arc<dyn MemoryBackend>,
        callbacks: Arc<dyn HostCallbacks>,
        config: CaptureConfig,
    ) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;
        Ok(Self {
            device,
            callbacks,
            config: Mutex::new(config),
            arena: FrameArena::new(),
            pools: Arc::new(BufferPools::new(memory)),
            state: Arc::new(Mutex::new(SessionStateMachine::default())),
            context: Mutex::new(Arc::new(SessionContext::new())),
            frame_limit: Arc::new(AtomicU64::new(u64::MAX)),
            active: Mutex::new(None),
            run: Mutex::new(None),
        })
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<Run>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionStateMachine> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_config(&self) -> MutexGuard<'_, CaptureConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_active(&self, runtime: Option<Arc<Runtime>>) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = runtime;
    }

    fn runtime(&self) -> Option<Arc<Runtime>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn require_runtime(&self, operation: &'static str) -> Result<Arc<Runtime>> {
        self.runtime().ok_or_else(|| PipelineError::InvalidState {
            operation,
            state: self.state().to_string(),
        })
    }

    fn transition(&self, next: SessionState, operation: &'static str) -> Result<()> {
        self.lock_state().transition(next, operation)
    }

    // ===== Queries =====

    pub fn config(&self) -> CaptureConfig {
        self.lock_config().clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().state()
    }

    pub fn bayer_mode(&self) -> ReprocessingBayerMode {
        ReprocessingBayerMode::from_config(&self.lock_config().bayer)
    }

    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.context.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn pool(&self, role: PoolRole) -> Arc<BufferPool> {
        self.pools.get(role)
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    /// Health of every stage of the active graphs
    pub fn health(&self) -> Vec<StageHealth> {
        let Some(rt) = self.runtime() else {
            return Vec::new();
        };
        let mut health = rt.stream.health();
        if let Some(graph) = &rt.reprocessing {
            health.extend(graph.health());
        }
        health
    }

    pub fn stats(&self) -> SessionStats {
        let runtime = self.runtime();
        let (mode, selector, in_flight, held) = match &runtime {
            Some(rt) => (rt.mode, rt.selector.stats(), rt.inflight.len(), rt.selector.len()),
            None => (self.bayer_mode(), SelectorStats::default(), 0, 0),
        };
        SessionStats {
            state: self.state(),
            mode,
            context: self.context().snapshot(),
            arena: self.arena.stats(),
            pools: self.pools.stats(),
            selector,
            in_flight,
            held,
        }
    }

    /// Poll the session counters until `done` holds or `timeout` passes
    pub fn wait_until(&self, timeout: Duration, done: impl Fn(&ContextSnapshot) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(&self.context().snapshot()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// Wait for the running capture sequence to end
    pub fn wait_capture_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.runtime().is_some_and(|rt| rt.capture_active())
            || self.state() == SessionState::CaptureInProgress
        {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL);
        }
        true
    }

    /// Limit the frames the feeder generates per run; `None` is unlimited
    pub fn set_frame_limit(&self, limit: Option<u64>) {
        self.frame_limit.store(limit.unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    // ===== Preview lifecycle =====

    pub fn start_preview(&self) -> Result<()> {
        let mut run = self.lock_run();
        self.transition(SessionState::PreviewStarting, "start_preview")?;
        let config = self.config();
        match self.launch(&config) {
            Ok(started) => {
                self.set_active(Some(Arc::clone(&started.runtime)));
                *run = Some(started);
                self.transition(SessionState::PreviewRunning, "start_preview")
            }
            Err(e) => {
                warn!(error = %e, "Preview start failed");
                self.transition(SessionState::PreviewStopping, "start_preview")?;
                self.transition(SessionState::Idle, "start_preview")?;
                Err(e)
            }
        }
    }

    /// Stop the preview and release every run resource
    ///
    /// Stopping an idle session is a no-op.
    pub fn stop_preview(&self) -> Result<StopReport> {
        let taken = {
            let mut run = self.lock_run();
            if self.state() == SessionState::Idle {
                return Ok(StopReport::default());
            }
            self.transition(SessionState::PreviewStopping, "stop_preview")?;
            self.set_active(None);
            run.take()
        };
        let report = match taken {
            Some(run) => self.shutdown(run),
            None => StopReport::default(),
        };
        self.transition(SessionState::Idle, "stop_preview")?;
        if report.is_clean() {
            info!(drained = report.drained, queued = report.queued, "Preview stopped");
        } else {
            warn!(
                purged = report.purged,
                leaked = report.leaked_buffers,
                "Preview stopped with leftovers"
            );
        }
        Ok(report)
    }

    /// Rebuild the graphs for a new capture mode without leaving the session
    pub fn restart_preview(&self, config: CaptureConfig) -> Result<()> {
        let config = config.normalized();
        config.validate()?;
        let mut run = self.lock_run();
        let recording = {
            let mut state = self.lock_state();
            state.transition(SessionState::Restarting, "restart_preview")?;
            // Vision graphs cannot record
            let keep = state.is_recording() && !config.options.vision;
            state.set_recording(keep);
            keep
        };
        self.set_active(None);
        if let Some(previous) = run.take() {
            let report = self.shutdown(previous);
            debug!(?report, "Previous run torn down for restart");
        }
        *self.lock_config() = config.clone();

        match self.launch(&config) {
            Ok(started) => {
                self.set_active(Some(Arc::clone(&started.runtime)));
                *run = Some(started);
                let resumed = {
                    let mut state = self.lock_state();
                    let resumed = state.after_restart();
                    state.transition(resumed, "restart_preview")?;
                    resumed
                };
                info!(mode = %self.bayer_mode(), recording, state = %resumed, "Preview restarted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Preview restart failed");
                self.transition(SessionState::PreviewStopping, "restart_preview")?;
                self.transition(SessionState::Idle, "restart_preview")?;
                Err(e)
            }
        }
    }

    /// Resolve, wire and start everything one run needs
    fn launch(&self, config: &CaptureConfig) -> Result<Run> {
        let context = Arc::new(SessionContext::new());
        *self.context.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&context);

        let mut table = GraphTable::new(
            Arc::clone(&self.device),
            Arc::clone(&self.arena),
            Arc::clone(&self.pools),
        );
        let vision = config.options.vision;
        let stream_kind = if vision {
            FactoryKind::Vision
        } else {
            FactoryKind::Preview
        };
        let stream_handle = table.resolve(stream_kind, config);
        let stream = table
            .get(stream_handle)
            .ok_or_else(|| PipelineError::Config(format!("no graph for {}", stream_kind)))?;
        let reprocessing = if config.bayer.reprocessing {
            let handle = table.resolve(FactoryKind::reprocessing_variant(config), config);
            table.get(handle)
        } else {
            None
        };
        let output_pipe = if vision { PipeId::Flite } else { PipeId::Scp };

        let runtime = Arc::new(Runtime::new(RuntimeParts {
            config: config.clone(),
            arena: Arc::clone(&self.arena),
            pools: Arc::clone(&self.pools),
            callbacks: Arc::clone(&self.callbacks),
            context,
            state: Arc::clone(&self.state),
            stream: Arc::clone(&stream),
            output_pipe,
            reprocessing: reprocessing.clone(),
            frame_limit: Arc::clone(&self.frame_limit),
        }));

        let brought_up = Feeder::new(Arc::clone(&runtime)).and_then(|mut feeder| {
            wire_outputs(&runtime, &stream, reprocessing.as_deref())?;
            stream.create()?;
            if let Some(graph) = &reprocessing {
                graph.create()?;
            }
            stream.start()?;
            if let Some(graph) = &reprocessing {
                graph.start()?;
            }
            let workers = spawn_workers(&runtime)?;
            let watchdog = watchdog::start(Arc::clone(&runtime))?;
            let feeder = WorkerController::start("preview-feeder", move || feeder.run_once())?;
            Ok((feeder, watchdog, workers))
        });
        let (feeder, watchdog, workers) = match brought_up {
            Ok(started) => started,
            Err(e) => {
                for id in table.teardown_all() {
                    runtime.release(id, "failed start");
                }
                if let Err(release) = self.pools.deinit_all() {
                    warn!(error = %release, "Pools not released after failed start");
                }
                return Err(e);
            }
        };

        info!(
            graph = %stream.name(),
            mode = %runtime.mode,
            reprocessing = reprocessing.is_some(),
            workers = workers.len(),
            "Preview running"
        );
        Ok(Run {
            runtime,
            table,
            feeder,
            watchdog,
            workers,
        })
    }

    /// Tear a run down; every frame and buffer it touched is given back
    fn shutdown(&self, mut run: Run) -> StopReport {
        let rt = Arc::clone(&run.runtime);
        let mut report = StopReport::default();

        run.feeder.stop();
        let mut drained = rt.stream.stop();
        if let Some(graph) = &rt.reprocessing {
            drained.extend(graph.stop());
        }
        report.drained = drained.len();
        // Frames are settled before any reference goes so none is deleted mid-route
        let cut_off: HashSet<FrameId> = drained.iter().copied().chain(rt.inflight.ids()).collect();
        report.aborted = cut_off.into_iter().filter(|&id| rt.abort_frame(id)).count();
        for id in drained {
            rt.release(id, "stop drain");
        }

        rt.selector.cancel_picture();
        rt.stop.store(true, Ordering::SeqCst);
        run.workers.stop_all();
        run.watchdog.stop();

        report.queued = rt.drain_queues();
        rt.abandon_capture();
        rt.selector.set_policy(None);
        rt.withdraw_arming();
        let in_flight = rt.inflight.drain();
        report.in_flight = in_flight.len();
        for id in in_flight {
            rt.release(id, "in-flight stop");
        }
        rt.selector.clear_list();
        let late = run.table.teardown_all();
        report.drained += late.len();
        report.aborted += late.iter().filter(|&&id| rt.abort_frame(id)).count();
        for id in late {
            rt.release(id, "teardown drain");
        }

        report.purged = self.arena.purge();
        report.leaked_buffers = self
            .pools
            .stats()
            .values()
            .map(|stats| stats.capacity - stats.available)
            .sum();
        if report.leaked_buffers > 0 {
            let reclaimed = self.pools.reset_all();
            warn!(leaked = report.leaked_buffers, reclaimed, "Buffers still checked out at stop");
        }
        if let Err(e) = self.pools.deinit_all() {
            warn!(error = %e, "Pools not fully released");
        }
        report
    }

    // ===== Recording =====

    pub fn start_recording(&self) -> Result<()> {
        let rt = self.require_runtime("start_recording")?;
        if rt.config.options.vision {
            return Err(PipelineError::InvalidState {
                operation: "start_recording",
                state: "vision".to_string(),
            });
        }
        {
            let mut state = rt.lock_state();
            if state.state() == SessionState::CaptureInProgress {
                state.set_recording(true);
            } else {
                state.transition(SessionState::RecordingRunning, "start_recording")?;
            }
        }
        rt.recording_skip
            .store(rt.config.recording_skip_frames, Ordering::SeqCst);
        info!("Recording started");
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<()> {
        let rt = self.require_runtime("stop_recording")?;
        let mut state = rt.lock_state();
        match state.state() {
            SessionState::CaptureInProgress if state.is_recording() => state.set_recording(false),
            _ if state.is_recording() => {
                state.transition(SessionState::PreviewRunning, "stop_recording")?
            }
            other => {
                return Err(PipelineError::InvalidState {
                    operation: "stop_recording",
                    state: other.to_string(),
                });
            }
        }
        info!("Recording stopped");
        Ok(())
    }

    // ===== Still capture =====

    /// Start a capture sequence of `shots` pictures; returns its sync-log id
    pub fn take_picture(&self, shots: u32, intent: CaptureIntent) -> Result<u64> {
        let rt = self.require_runtime("take_picture")?;
        if shots == 0 {
            return Err(PipelineError::Config("a capture needs at least one shot".to_string()));
        }
        let hold_pipe = rt.mode.hold_pipe();
        if rt.config.options.vision || !rt.stream.topology().contains(hold_pipe) {
            return Err(PipelineError::InvalidState {
                operation: "take_picture",
                state: format!("{} without {}", rt.stream.name(), hold_pipe),
            });
        }
        rt.lock_state()
            .transition(SessionState::CaptureInProgress, "take_picture")?;

        let policy = SelectionPolicy::from_intent(&intent);
        rt.selector.set_policy(Some(policy));
        let seq = rt.context.next_sync_log_id();
        rt.begin_capture(seq, shots);

        if rt.mode.is_dynamic() {
            let boosted = if rt.config.bayer.boost_dynamic_capture {
                rt.inflight.request_rework(hold_pipe)
            } else {
                0
            };
            let wanted = shots.saturating_add(rt.config.bayer.dynamic_arm_margin);
            let arming = wanted.saturating_sub(boosted as u32);
            rt.lock_bayer().arm(arming);
            rt.context.holds_armed(arming);
        }
        rt.queues.shutter.push(CaptureRequest { seq, shots, intent });
        info!(seq, shots, policy = %policy, mode = %rt.mode, "Capture requested");
        Ok(seq)
    }

    /// Abandon a capture waiting on the hold list; returns frames dropped
    pub fn cancel_picture(&self) -> Result<usize> {
        let rt = self.require_runtime("cancel_picture")?;
        let dropped = rt.selector.cancel_picture();
        rt.withdraw_arming();
        Ok(dropped)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.state() != SessionState::Idle {
            if let Err(e) = self.stop_preview() {
                warn!(error = %e, "Session dropped without a clean stop");
            }
        }
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.state())
            .field("live_frames", &self.arena.live())
            .finish()
    }
}

/// Route graph outputs into the worker queues
fn wire_outputs(rt: &Runtime, stream: &PipeGraph, reprocessing: Option<&PipeGraph>) -> Result<()> {
    for node in stream.topology().nodes() {
        let queue = if node.pipe == PipeId::Jpeg {
            rt.queues.post_picture.clone()
        } else {
            rt.queues.frame_done.clone()
        };
        stream.set_output_frame_q_to_pipe(queue, node.pipe)?;
    }
    if let Some(graph) = reprocessing {
        let last = graph
            .topology()
            .last()
            .ok_or_else(|| PipelineError::Config(format!("{} graph has no stages", graph.name())))?;
        graph.set_output_frame_q_to_pipe(rt.queues.post_picture.clone(), last)?;
    }
    Ok(())
}

fn queue_worker<T: Send + 'static>(
    rt: &Arc<Runtime>,
    name: &str,
    queue: &FrameQueue<T>,
    handler: fn(&Runtime, T) -> LoopAction,
) -> Result<WorkerController> {
    let runtime = Arc::clone(rt);
    WorkerController::queue_worker(
        name,
        Arc::clone(&rt.stop),
        queue.clone(),
        rt.config.timing.queue_wait(),
        move |item| handler(&runtime, item),
    )
}

fn spawn_workers(rt: &Arc<Runtime>) -> Result<WorkerSet> {
    let queues = &rt.queues;
    let mut workers = WorkerSet::default();
    workers.push(queue_worker(rt, "frame-done", &queues.frame_done, preview::handle_frame_done)?);
    workers.push(queue_worker(rt, "recording", &queues.recording, recording::handle_video)?);
    workers.push(queue_worker(rt, "faces", &queues.faces, recording::handle_faces)?);
    workers.push(queue_worker(rt, "shutter", &queues.shutter, capture::handle_shutter)?);
    workers.push(queue_worker(rt, "picture", &queues.picture, capture::handle_picture)?);
    workers.push(queue_worker(rt, "post-picture", &queues.post_picture, capture::handle_post_picture)?);
    for index in 0..rt.config.jpeg_save_threads.max(1) {
        workers.push(queue_worker(
            rt,
            &format!("jpeg-save-{}", index),
            &queues.save,
            capture::handle_save,
        )?);
    }
    Ok(workers)
}
