// SPDX-License-Identifier: GPL-3.0-only

//! Concrete pipe graph
//!
//! Owns one [`Pipe`] per topology node and the [`Router`] wiring them.
//! Lifecycle: `create` (open devices) → `start` (stream on, workers up) →
//! `stop` (best-effort, drains carried frames) → `destroy` (close devices).

use super::Topology;
use crate::backends::DeviceBackend;
use crate::buffers::BufferPools;
use crate::config::CaptureConfig;
use crate::errors::{PipelineError, Result};
use crate::frame::{FrameArena, FrameId};
use crate::pipes::{FrameQueue, Pipe, PipeId, PipeSetup, Router, StageHealth};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Default)]
struct GraphInner {
    pipes: Vec<Pipe>,
    running: bool,
}

/// One concrete, possibly shared, stage graph
pub struct PipeGraph {
    name: String,
    topology: Topology,
    config: CaptureConfig,
    device: Arc<dyn DeviceBackend>,
    arena: Arc<FrameArena>,
    pools: Arc<BufferPools>,
    router: Router,
    inner: Mutex<GraphInner>,
}

impl PipeGraph {
    pub fn new(
        name: &str,
        topology: Topology,
        config: CaptureConfig,
        device: Arc<dyn DeviceBackend>,
        arena: Arc<FrameArena>,
        pools: Arc<BufferPools>,
    ) -> Self {
        Self {
            name: name.to_string(),
            topology,
            config,
            device,
            arena,
            pools,
            router: Router::default(),
            inner: Mutex::new(GraphInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_created(&self) -> bool {
        !self.lock().pipes.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Allocate this graph's pools and open every stage device
    ///
    /// No-op when already created. A stage that fails to open closes the
    /// ones opened before it.
    pub fn create(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.pipes.is_empty() {
            return Ok(());
        }
        self.pools
            .allocate(&self.config, &self.topology.pool_roles())?;

        let timing = &self.config.timing;
        let mut pipes = Vec::with_capacity(self.topology.nodes().len());
        for node in self.topology.nodes() {
            let setup = PipeSetup {
                pipe: node.pipe,
                source: node.source,
                dst_pool: node.dst.map(|role| self.pools.get(role)),
                format: node.stage_format(&self.config),
                prepare: node.prepare,
                queue_wait: timing.queue_wait(),
                dequeue_wait: timing.dequeue_wait(),
            };
            let pipe = Pipe::new(
                setup,
                Arc::clone(&self.device),
                Arc::clone(&self.arena),
                self.router.clone(),
            );
            if let Err(e) = pipe.open() {
                warn!(graph = %self.name, pipe = %node.pipe, error = %e, "Graph create failed");
                // Dropping a pipe closes its device
                drop(pipes);
                return Err(e);
            }
            pipes.push(pipe);
        }
        info!(graph = %self.name, stages = pipes.len(), "Pipe graph created");
        inner.pipes = pipes;
        Ok(())
    }

    /// Stream on every stage
    ///
    /// Downstream stages start first so nothing is forwarded into a stopped
    /// pipe. A failing stage rolls back the ones already started.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.pipes.is_empty() {
            return Err(PipelineError::InvalidState {
                operation: "start",
                state: format!("graph {} not created", self.name),
            });
        }
        if inner.running {
            return Ok(());
        }
        for (position, pipe) in inner.pipes.iter().enumerate().rev() {
            if let Err(e) = pipe.start() {
                warn!(graph = %self.name, pipe = %pipe.id(), error = %e, "Graph start failed, rolling back");
                for started in &inner.pipes[position + 1..] {
                    for id in started.stop() {
                        if let Err(release) = self.arena.release(id) {
                            warn!(
                                graph = %self.name,
                                pipe = %started.id(),
                                %id,
                                error = %release,
                                "Frame release failed during start rollback"
                            );
                        }
                    }
                }
                return Err(e);
            }
        }
        inner.running = true;
        info!(graph = %self.name, "Pipe graph started");
        Ok(())
    }

    /// Stop every stage, upstream first
    ///
    /// Never fails; stages already stopped are skipped. Returns the frames
    /// the stages still carried. The caller takes over those references.
    pub fn stop(&self) -> Vec<FrameId> {
        let mut inner = self.lock();
        let drained: Vec<FrameId> = inner.pipes.iter().flat_map(|pipe| pipe.stop()).collect();
        if inner.running {
            info!(graph = %self.name, drained = drained.len(), "Pipe graph stopped");
        }
        inner.running = false;
        drained
    }

    /// Stop and close every stage
    pub fn destroy(&self) -> Vec<FrameId> {
        let drained = self.stop();
        let pipes = std::mem::take(&mut self.lock().pipes);
        for pipe in &pipes {
            pipe.close();
        }
        self.router.clear_outputs();
        debug!(graph = %self.name, "Pipe graph destroyed");
        drained
    }

    /// Enqueue a frame on a stage's input queue
    pub fn push_frame_to_pipe(&self, pipe: PipeId, id: FrameId) -> Result<()> {
        let inner = self.lock();
        let target = inner
            .pipes
            .iter()
            .find(|p| p.id() == pipe)
            .ok_or(PipelineError::PipeNotInGraph(pipe))?;
        target.push(id);
        Ok(())
    }

    /// Deliver frames that finish their route at `pipe` to `queue`
    pub fn set_output_frame_q_to_pipe(&self, queue: FrameQueue, pipe: PipeId) -> Result<()> {
        if !self.topology.contains(pipe) {
            return Err(PipelineError::PipeNotInGraph(pipe));
        }
        self.router.set_output(pipe, queue);
        Ok(())
    }

    /// Route through this graph with the requested optional stages
    pub fn route(&self, requested: &[PipeId]) -> Vec<PipeId> {
        self.topology.route(requested)
    }

    pub fn health(&self) -> Vec<StageHealth> {
        self.lock().pipes.iter().map(|pipe| pipe.health()).collect()
    }
}

impl std::fmt::Debug for PipeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeGraph")
            .field("name", &self.name)
            .field("stages", &self.topology.nodes().len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{HeapMemory, VirtualDevice};
    use crate::factory::FactoryKind;
    use crate::frame::{EntityState, Frame, FrameKind};
    use crate::pipes::Popped;
    use std::time::{Duration, Instant};

    fn graph(device: &Arc<VirtualDevice>) -> (PipeGraph, Arc<FrameArena>, Arc<BufferPools>) {
        let config = CaptureConfig::compact();
        let arena = FrameArena::new();
        let pools = Arc::new(BufferPools::new(Arc::new(HeapMemory::new())));
        let topology = Topology::for_kind(FactoryKind::Preview, &config);
        let graph = PipeGraph::new(
            "preview",
            topology,
            config,
            device.clone(),
            arena.clone(),
            pools.clone(),
        );
        (graph, arena, pools)
    }

    #[test]
    fn test_create_is_idempotent() {
        let device = Arc::new(VirtualDevice::new());
        let (graph, _, pools) = graph(&device);
        graph.create().unwrap();
        graph.create().unwrap();
        assert_eq!(device.open_count(PipeId::Flite), 1);
        assert!(!pools.allocated_roles().is_empty());
    }

    #[test]
    fn test_create_failure_closes_opened_stages() {
        let device = Arc::new(VirtualDevice::new());
        device.fail_configure(PipeId::Scp);
        let (graph, _, _) = graph(&device);
        assert!(matches!(graph.create(), Err(PipelineError::StageInit { pipe: PipeId::Scp, .. })));
        assert_eq!(device.open_devices(), 0);
        assert!(!graph.is_created());
    }

    #[test]
    fn test_start_requires_create() {
        let device = Arc::new(VirtualDevice::new());
        let (graph, _, _) = graph(&device);
        assert!(matches!(graph.start(), Err(PipelineError::InvalidState { .. })));
    }

    #[test]
    fn test_partial_start_rolls_back() {
        let device = Arc::new(VirtualDevice::new());
        device.fail_stream_on(PipeId::Flite);
        let (graph, _, _) = graph(&device);
        graph.create().unwrap();
        assert!(graph.start().is_err());
        assert!(!graph.is_running());
        assert!(!device.is_streaming(PipeId::Scp));
        assert!(!device.is_streaming(PipeId::ThreeAaIsp));
    }

    #[test]
    fn test_partial_start_releases_carried_frames() {
        let device = Arc::new(VirtualDevice::new());
        device.fail_stream_on(PipeId::Flite);
        device.stall(PipeId::Scp);
        let (graph, arena, pools) = graph(&device);
        graph.create().unwrap();
        let id = arena.insert(Frame::new(1, 1, FrameKind::Preview, &[PipeId::Scp]));
        graph.push_frame_to_pipe(PipeId::Scp, id).unwrap();

        assert!(matches!(
            graph.start(),
            Err(PipelineError::StageInit { pipe: PipeId::Flite, .. })
        ));
        assert!(!arena.contains(id));
        let stats = arena.stats();
        assert_eq!(stats.created, stats.deleted);
        assert!(pools.all_returned());
    }

    #[test]
    fn test_stop_twice_is_noop() {
        let device = Arc::new(VirtualDevice::new());
        let (graph, _, _) = graph(&device);
        graph.create().unwrap();
        graph.start().unwrap();
        assert!(graph.stop().is_empty());
        assert!(graph.stop().is_empty());
        assert!(!graph.is_running());
    }

    #[test]
    fn test_push_to_unknown_pipe() {
        let device = Arc::new(VirtualDevice::new());
        let (graph, arena, _) = graph(&device);
        graph.create().unwrap();
        let id = arena.insert(Frame::new(1, 1, FrameKind::Preview, &[PipeId::Flite]));
        assert!(matches!(
            graph.push_frame_to_pipe(PipeId::JpegReprocessing, id),
            Err(PipelineError::PipeNotInGraph(PipeId::JpegReprocessing))
        ));
        assert!(matches!(
            graph.set_output_frame_q_to_pipe(FrameQueue::new("out"), PipeId::Isp),
            Err(PipelineError::PipeNotInGraph(PipeId::Isp))
        ));
        arena.with_mut(id, |f| f.abort()).unwrap();
        arena.release(id).unwrap();
    }

    #[test]
    fn test_frame_flows_through_route() {
        let device = Arc::new(VirtualDevice::new());
        let (graph, arena, pools) = graph(&device);
        graph.create().unwrap();
        let done = FrameQueue::new("done");
        let route = graph.route(&[]);
        let last = *route.last().unwrap();
        graph.set_output_frame_q_to_pipe(done.clone(), last).unwrap();
        graph.start().unwrap();

        let id = arena.insert(Frame::new(1, 1, FrameKind::Preview, &route));
        graph.push_frame_to_pipe(route[0], id).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut finished = None;
        while finished.is_none() && Instant::now() < deadline {
            if let Popped::Item(id) = done.wait_and_pop(Duration::from_millis(50)) {
                finished = Some(id);
            }
        }
        assert_eq!(finished, Some(id));
        let states: Vec<EntityState> = arena
            .with(id, |f| f.entities().iter().map(|e| e.state()).collect())
            .unwrap();
        assert!(states.iter().all(|s| *s == EntityState::Complete));

        arena.release(id).unwrap();
        assert!(graph.stop().is_empty());
        assert!(pools.all_returned());
    }
}
