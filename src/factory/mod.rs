// SPDX-License-Identifier: GPL-3.0-only

//! Pipe graph factories
//!
//! A [`FactoryKind`] names a capture-mode layout. Kinds whose [`Topology`]
//! is identical share one concrete [`PipeGraph`] through the [`GraphTable`],
//! so two logical factories never claim the same hardware twice.
//!
//! ```text
//! FactoryKind::Preview ─────┐
//!                           ├─▶ GraphId(0) ─▶ PipeGraph (FLITE, 3AA_ISP, SCP, ...)
//! FactoryKind::ThreeAaIspOtf┘
//! FactoryKind::Reprocessing ──▶ GraphId(1) ─▶ PipeGraph (3AA_REP, ISP_REP, JPEG_REP)
//! ```
//!
//! The engine holds [`StageGraph`] handles, tagged by the capability the
//! graph serves, never the graph itself.

pub mod graph;
pub mod topology;

pub use graph::PipeGraph;
pub use topology::{NodeSpec, Topology};

use crate::backends::DeviceBackend;
use crate::buffers::BufferPools;
use crate::config::CaptureConfig;
use crate::frame::{FrameArena, FrameId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Logical capture-mode layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactoryKind {
    /// Whichever preview layout the configuration calls for
    Preview,
    DualPreview,
    ThreeAaIspOtf,
    ThreeAaIspM2m,
    ThreeAaIspOtfTpu,
    ThreeAaIspM2mTpu,
    Reprocessing,
    ReprocessingNv21,
    Vision,
}

impl FactoryKind {
    pub fn name(&self) -> &'static str {
        match self {
            FactoryKind::Preview => "preview",
            FactoryKind::DualPreview => "dual-preview",
            FactoryKind::ThreeAaIspOtf => "3aa-isp-otf",
            FactoryKind::ThreeAaIspM2m => "3aa-isp-m2m",
            FactoryKind::ThreeAaIspOtfTpu => "3aa-isp-otf-tpu",
            FactoryKind::ThreeAaIspM2mTpu => "3aa-isp-m2m-tpu",
            FactoryKind::Reprocessing => "reprocessing",
            FactoryKind::ReprocessingNv21 => "reprocessing-nv21",
            FactoryKind::Vision => "vision",
        }
    }

    /// Concrete preview layout for a configuration
    pub fn preview_variant(config: &CaptureConfig) -> FactoryKind {
        let options = &config.options;
        if options.dual_preview {
            return FactoryKind::DualPreview;
        }
        match (options.three_aa_isp_otf, options.tpu_stabilization) {
            (true, false) => FactoryKind::ThreeAaIspOtf,
            (true, true) => FactoryKind::ThreeAaIspOtfTpu,
            (false, false) => FactoryKind::ThreeAaIspM2m,
            (false, true) => FactoryKind::ThreeAaIspM2mTpu,
        }
    }

    /// Reprocessing layout for a configuration
    pub fn reprocessing_variant(config: &CaptureConfig) -> FactoryKind {
        if config.options.nv21_picture {
            FactoryKind::ReprocessingNv21
        } else {
            FactoryKind::Reprocessing
        }
    }

    /// 3AA and ISP are separate memory-to-memory stages
    pub fn is_m2m(&self) -> bool {
        matches!(self, FactoryKind::ThreeAaIspM2m | FactoryKind::ThreeAaIspM2mTpu)
    }

    pub fn has_tpu(&self) -> bool {
        matches!(self, FactoryKind::ThreeAaIspOtfTpu | FactoryKind::ThreeAaIspM2mTpu)
    }

    /// Handle tag for graphs of this kind
    fn tag(&self, id: GraphId) -> StageGraph {
        match self {
            FactoryKind::DualPreview => StageGraph::DualPreview(id),
            FactoryKind::Reprocessing | FactoryKind::ReprocessingNv21 => StageGraph::Reprocessing(id),
            FactoryKind::Vision => StageGraph::Vision(id),
            _ => StageGraph::Preview(id),
        }
    }
}

impl std::fmt::Display for FactoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Index of a concrete graph in the [`GraphTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(usize);

/// Graph handle tagged by the role it plays in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageGraph {
    Preview(GraphId),
    DualPreview(GraphId),
    Reprocessing(GraphId),
    Vision(GraphId),
}

impl StageGraph {
    pub fn id(&self) -> GraphId {
        match *self {
            StageGraph::Preview(id)
            | StageGraph::DualPreview(id)
            | StageGraph::Reprocessing(id)
            | StageGraph::Vision(id) => id,
        }
    }
}

/// De-duplicated table of concrete graphs
pub struct GraphTable {
    device: Arc<dyn DeviceBackend>,
    arena: Arc<FrameArena>,
    pools: Arc<BufferPools>,
    graphs: Vec<Option<Arc<PipeGraph>>>,
    aliases: HashMap<FactoryKind, GraphId>,
}

impl GraphTable {
    pub fn new(device: Arc<dyn DeviceBackend>, arena: Arc<FrameArena>, pools: Arc<BufferPools>) -> Self {
        Self {
            device,
            arena,
            pools,
            graphs: Vec::new(),
            aliases: HashMap::new(),
        }
    }

    /// Graph for `kind`, reusing any live graph with the same topology
    ///
    /// The graph is not created; call [`PipeGraph::create`] on it.
    pub fn resolve(&mut self, kind: FactoryKind, config: &CaptureConfig) -> StageGraph {
        if let Some(&id) = self.aliases.get(&kind) {
            return kind.tag(id);
        }
        let topology = Topology::for_kind(kind, config);
        let existing = self.graphs.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|graph| *graph.topology() == topology)
        });
        let id = match existing {
            Some(index) => {
                debug!(kind = %kind, graph = index, "Factory aliases existing graph");
                GraphId(index)
            }
            None => {
                let graph = PipeGraph::new(
                    kind.name(),
                    topology,
                    config.clone(),
                    Arc::clone(&self.device),
                    Arc::clone(&self.arena),
                    Arc::clone(&self.pools),
                );
                let id = match self.graphs.iter().position(|slot| slot.is_none()) {
                    Some(index) => {
                        self.graphs[index] = Some(Arc::new(graph));
                        GraphId(index)
                    }
                    None => {
                        self.graphs.push(Some(Arc::new(graph)));
                        GraphId(self.graphs.len() - 1)
                    }
                };
                info!(kind = %kind, graph = id.0, "New pipe graph");
                id
            }
        };
        self.aliases.insert(kind, id);
        kind.tag(id)
    }

    pub fn get(&self, handle: StageGraph) -> Option<Arc<PipeGraph>> {
        self.graphs.get(handle.id().0).and_then(|slot| slot.clone())
    }

    /// Logical kinds currently pointing at `handle`'s graph
    pub fn aliases_of(&self, handle: StageGraph) -> Vec<FactoryKind> {
        let mut kinds: Vec<FactoryKind> = self
            .aliases
            .iter()
            .filter(|(_, id)| **id == handle.id())
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort_by_key(|kind| kind.name());
        kinds
    }

    /// Concrete graphs in the table
    pub fn len(&self) -> usize {
        self.graphs.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy a graph and drop every alias pointing at it
    ///
    /// Returns the frames its pipes still carried. A second teardown of the
    /// same handle finds nothing and returns an empty list.
    pub fn teardown(&mut self, handle: StageGraph) -> Vec<FrameId> {
        let id = handle.id();
        let Some(graph) = self.graphs.get_mut(id.0).and_then(|slot| slot.take()) else {
            return Vec::new();
        };
        self.aliases.retain(|_, alias| *alias != id);
        debug!(graph = %graph.name(), "Tearing down pipe graph");
        graph.destroy()
    }

    /// Destroy every graph
    pub fn teardown_all(&mut self) -> Vec<FrameId> {
        let handles: Vec<StageGraph> = (0..self.graphs.len())
            .map(|index| StageGraph::Preview(GraphId(index)))
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| self.teardown(handle))
            .collect()
    }
}

impl std::fmt::Debug for GraphTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphTable")
            .field("graphs", &self.len())
            .field("aliases", &self.aliases.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{HeapMemory, VirtualDevice};

    fn table() -> (GraphTable, Arc<VirtualDevice>) {
        let device = Arc::new(VirtualDevice::new());
        let pools = Arc::new(BufferPools::new(Arc::new(HeapMemory::new())));
        (GraphTable::new(device.clone(), FrameArena::new(), pools), device)
    }

    #[test]
    fn test_preview_variants() {
        let mut config = CaptureConfig::compact();
        assert_eq!(FactoryKind::preview_variant(&config), FactoryKind::ThreeAaIspOtf);
        config.options.tpu_stabilization = true;
        assert_eq!(FactoryKind::preview_variant(&config), FactoryKind::ThreeAaIspOtfTpu);
        config.options.three_aa_isp_otf = false;
        assert!(FactoryKind::preview_variant(&config).is_m2m());
        config.options.dual_preview = true;
        assert_eq!(FactoryKind::preview_variant(&config), FactoryKind::DualPreview);
    }

    #[test]
    fn test_identical_topologies_share_one_graph() {
        let (mut table, _) = table();
        let config = CaptureConfig::compact();
        let preview = table.resolve(FactoryKind::Preview, &config);
        let otf = table.resolve(FactoryKind::ThreeAaIspOtf, &config);
        assert_eq!(preview, otf);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.aliases_of(preview),
            vec![FactoryKind::Preview, FactoryKind::ThreeAaIspOtf]
        );

        let reprocessing = table.resolve(FactoryKind::Reprocessing, &config);
        assert!(matches!(reprocessing, StageGraph::Reprocessing(_)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_teardown_destroys_aliases_once() {
        let (mut table, device) = table();
        let config = CaptureConfig::compact();
        let preview = table.resolve(FactoryKind::Preview, &config);
        table.resolve(FactoryKind::ThreeAaIspOtf, &config);
        table.get(preview).unwrap().create().unwrap();
        assert!(device.open_devices() > 0);

        assert!(table.teardown(preview).is_empty());
        assert_eq!(device.open_devices(), 0);
        assert!(table.is_empty());
        assert!(table.aliases_of(preview).is_empty());
        assert!(table.teardown(preview).is_empty());
        assert!(table.get(preview).is_none());
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let (mut table, _) = table();
        let config = CaptureConfig::compact();
        let vision = table.resolve(FactoryKind::Vision, &config);
        table.teardown(vision);
        let preview = table.resolve(FactoryKind::Preview, &config);
        assert_eq!(preview.id(), vision.id());
        assert!(matches!(preview, StageGraph::Preview(_)));
    }
}
