// SPDX-License-Identifier: GPL-3.0-only

//! Pipe stages and the queues between them
//!
//! A pipe is one hardware-backed processing step. Each pipe owns an input
//! [`FrameQueue`] and a worker thread that moves frames through its device
//! and on to the next pipe of the frame's route.

pub mod queue;
pub mod stage;

pub use queue::{FrameQueue, Popped};
pub use stage::{Pipe, PipeSetup, Router, StageHealth};

use serde::{Deserialize, Serialize};

/// Identifier of a pipe stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PipeId {
    /// Sensor front-end (bayer out)
    Flite,
    /// 3A statistics / auto-exposure
    ThreeAa,
    /// 3AA capture node (processed bayer out)
    ThreeAc,
    /// 3AA and ISP chained on-the-fly
    ThreeAaIsp,
    Isp,
    /// TPU digital image stabilization
    Dis,
    /// Preview scaler output
    Scp,
    /// Still capture YUV output
    Scc,
    /// Face detection
    Vra,
    /// Recording scaler
    GscVideo,
    Jpeg,
    ThreeAaReprocessing,
    IspReprocessing,
    /// Reprocessing scaler producing NV21 stills
    GscReprocessing,
    JpegReprocessing,
}

impl PipeId {
    pub const ALL: [PipeId; 15] = [
        PipeId::Flite,
        PipeId::ThreeAa,
        PipeId::ThreeAc,
        PipeId::ThreeAaIsp,
        PipeId::Isp,
        PipeId::Dis,
        PipeId::Scp,
        PipeId::Scc,
        PipeId::Vra,
        PipeId::GscVideo,
        PipeId::Jpeg,
        PipeId::ThreeAaReprocessing,
        PipeId::IspReprocessing,
        PipeId::GscReprocessing,
        PipeId::JpegReprocessing,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipeId::Flite => "FLITE",
            PipeId::ThreeAa => "3AA",
            PipeId::ThreeAc => "3AC",
            PipeId::ThreeAaIsp => "3AA_ISP",
            PipeId::Isp => "ISP",
            PipeId::Dis => "DIS",
            PipeId::Scp => "SCP",
            PipeId::Scc => "SCC",
            PipeId::Vra => "VRA",
            PipeId::GscVideo => "GSC_VIDEO",
            PipeId::Jpeg => "JPEG",
            PipeId::ThreeAaReprocessing => "3AA_REPROCESSING",
            PipeId::IspReprocessing => "ISP_REPROCESSING",
            PipeId::GscReprocessing => "GSC_REPROCESSING",
            PipeId::JpegReprocessing => "JPEG_REPROCESSING",
        }
    }

    /// Pipe belongs to a reprocessing graph
    pub fn is_reprocessing(&self) -> bool {
        matches!(
            self,
            PipeId::ThreeAaReprocessing
                | PipeId::IspReprocessing
                | PipeId::GscReprocessing
                | PipeId::JpegReprocessing
        )
    }
}

impl std::fmt::Display for PipeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
