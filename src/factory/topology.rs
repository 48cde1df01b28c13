// SPDX-License-Identifier: GPL-3.0-only

//! Stage layouts per factory kind
//!
//! A topology is plain data: the ordered nodes of a graph with their buffer
//! sources and pool bindings. Two factory kinds that produce equal
//! topologies share one concrete graph.
//!
//! ```text
//! OTF:  FLITE ─▶ 3AA_ISP ─▶ [DIS] ─▶ SCP ─▶ [VRA] ─▶ [GSC_VIDEO]
//!                   └──────▶ [SCC] ─▶ [JPEG]
//! M2M:  FLITE ─▶ 3AA ─▶ [3AC] ─▶ ISP ─▶ [DIS] ─▶ SCP ─▶ ...
//! REPROCESSING: 3AA_REPROCESSING ─▶ ISP_REPROCESSING ─▶ JPEG_REPROCESSING
//!                                                   └─▶ GSC_REPROCESSING (NV21)
//! ```

use super::FactoryKind;
use crate::backends::{PixelFormat, StageFormat};
use crate::buffers::{PoolPlan, PoolRole};
use crate::config::CaptureConfig;
use crate::pipes::PipeId;

/// One stage of a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeSpec {
    pub pipe: PipeId,
    /// Upstream stage whose output this stage reads
    pub source: Option<PipeId>,
    /// Pool the stage writes into
    pub dst: Option<PoolRole>,
    /// Only present on frames that request it
    pub optional: bool,
    pub prepare: usize,
}

impl NodeSpec {
    fn new(pipe: PipeId, source: Option<PipeId>, dst: Option<PoolRole>, prepare: usize) -> Self {
        Self {
            pipe,
            source,
            dst,
            optional: false,
            prepare: prepare.max(1),
        }
    }

    fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Device format for this stage
    pub fn stage_format(&self, config: &CaptureConfig) -> StageFormat {
        match self.dst {
            Some(role) => {
                let plan = PoolPlan::for_role(role, config);
                StageFormat {
                    format: plan.format,
                    size: plan.size,
                }
            }
            None => match self.pipe {
                PipeId::Vra => StageFormat {
                    format: PixelFormat::Yuyv,
                    size: config.geometry.preview,
                },
                PipeId::ThreeAaIsp => StageFormat {
                    format: PixelFormat::Nv21,
                    size: config.geometry.sensor,
                },
                _ => StageFormat {
                    format: PixelFormat::Bayer16,
                    size: config.geometry.sensor,
                },
            },
        }
    }
}

/// Ordered stage layout of one graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topology {
    nodes: Vec<NodeSpec>,
}

impl Topology {
    /// Layout for a factory kind under `config`
    ///
    /// `config` is expected to be normalized.
    pub fn for_kind(kind: FactoryKind, config: &CaptureConfig) -> Self {
        let prepare = config.scaled_prepare();
        let options = &config.options;
        let bayer = &config.bayer;
        let nodes = match kind {
            FactoryKind::Preview => {
                return Self::for_kind(FactoryKind::preview_variant(config), config);
            }
            FactoryKind::DualPreview => vec![
                NodeSpec::new(PipeId::Flite, None, Some(PoolRole::Sensor), prepare.flite),
                NodeSpec::new(PipeId::ThreeAaIsp, Some(PipeId::Flite), None, prepare.three_aa_isp),
                NodeSpec::new(PipeId::Scp, Some(PipeId::ThreeAaIsp), Some(PoolRole::Scaler), prepare.scp),
            ],
            FactoryKind::ThreeAaIspOtf
            | FactoryKind::ThreeAaIspM2m
            | FactoryKind::ThreeAaIspOtfTpu
            | FactoryKind::ThreeAaIspM2mTpu => {
                let mut nodes = vec![NodeSpec::new(
                    PipeId::Flite,
                    None,
                    Some(PoolRole::Sensor),
                    prepare.flite,
                )];
                let isp = if kind.is_m2m() {
                    nodes.push(NodeSpec::new(
                        PipeId::ThreeAa,
                        Some(PipeId::Flite),
                        Some(PoolRole::ThreeAa),
                        prepare.three_aa_isp,
                    ));
                    if bayer.reprocessing && !bayer.pure {
                        nodes.push(
                            NodeSpec::new(
                                PipeId::ThreeAc,
                                Some(PipeId::Flite),
                                Some(PoolRole::DirtyBayer),
                                prepare.three_ac,
                            )
                            .optional(),
                        );
                    }
                    nodes.push(NodeSpec::new(
                        PipeId::Isp,
                        Some(PipeId::ThreeAa),
                        Some(PoolRole::Isp),
                        prepare.isp,
                    ));
                    PipeId::Isp
                } else {
                    nodes.push(NodeSpec::new(
                        PipeId::ThreeAaIsp,
                        Some(PipeId::Flite),
                        None,
                        prepare.three_aa_isp,
                    ));
                    PipeId::ThreeAaIsp
                };
                let mut scaler_source = isp;
                if kind.has_tpu() {
                    nodes.push(NodeSpec::new(PipeId::Dis, Some(isp), Some(PoolRole::Tpu), prepare.isp));
                    scaler_source = PipeId::Dis;
                }
                nodes.push(NodeSpec::new(
                    PipeId::Scp,
                    Some(scaler_source),
                    Some(PoolRole::Scaler),
                    prepare.scp,
                ));
                if !bayer.reprocessing {
                    nodes.push(
                        NodeSpec::new(PipeId::Scc, Some(isp), Some(PoolRole::Picture), prepare.scc)
                            .optional(),
                    );
                }
                if options.face_detection {
                    nodes.push(NodeSpec::new(PipeId::Vra, Some(PipeId::Scp), None, 1).optional());
                }
                nodes.push(
                    NodeSpec::new(PipeId::GscVideo, Some(PipeId::Scp), Some(PoolRole::Recording), 1)
                        .optional(),
                );
                if !bayer.reprocessing {
                    nodes.push(
                        NodeSpec::new(PipeId::Jpeg, Some(PipeId::Scc), Some(PoolRole::Jpeg), 1)
                            .optional(),
                    );
                }
                nodes
            }
            FactoryKind::Reprocessing => vec![
                NodeSpec::new(PipeId::ThreeAaReprocessing, None, None, prepare.reprocessing),
                NodeSpec::new(
                    PipeId::IspReprocessing,
                    Some(PipeId::ThreeAaReprocessing),
                    Some(PoolRole::Picture),
                    prepare.reprocessing,
                ),
                NodeSpec::new(
                    PipeId::JpegReprocessing,
                    Some(PipeId::IspReprocessing),
                    Some(PoolRole::Jpeg),
                    prepare.reprocessing,
                ),
            ],
            FactoryKind::ReprocessingNv21 => vec![
                NodeSpec::new(PipeId::ThreeAaReprocessing, None, None, prepare.reprocessing),
                NodeSpec::new(
                    PipeId::IspReprocessing,
                    Some(PipeId::ThreeAaReprocessing),
                    Some(PoolRole::Isp),
                    prepare.reprocessing,
                ),
                NodeSpec::new(
                    PipeId::GscReprocessing,
                    Some(PipeId::IspReprocessing),
                    Some(PoolRole::Picture),
                    prepare.reprocessing,
                ),
            ],
            FactoryKind::Vision => vec![NodeSpec::new(
                PipeId::Flite,
                None,
                Some(PoolRole::Vision),
                prepare.flite,
            )],
        };
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn node(&self, pipe: PipeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.pipe == pipe)
    }

    pub fn contains(&self, pipe: PipeId) -> bool {
        self.node(pipe).is_some()
    }

    /// Pools this topology writes into
    pub fn pool_roles(&self) -> Vec<PoolRole> {
        let mut roles: Vec<PoolRole> = self.nodes.iter().filter_map(|n| n.dst).collect();
        roles.sort();
        roles.dedup();
        roles
    }

    /// Route of a frame: every mandatory node plus the requested optional ones
    pub fn route(&self, requested: &[PipeId]) -> Vec<PipeId> {
        self.nodes
            .iter()
            .filter(|n| !n.optional || requested.contains(&n.pipe))
            .map(|n| n.pipe)
            .collect()
    }

    /// Last node; receives frames no later node takes
    pub fn last(&self) -> Option<PipeId> {
        self.nodes.last().map(|n| n.pipe)
    }
}
