// SPDX-License-Identifier: GPL-3.0-only

//! Hardware buffer pools
//!
//! One [`BufferPool`] per stage role, owned by a [`BufferPools`] registry
//! that sizes them from the capture configuration.

pub mod pool;
pub mod registry;

pub use pool::{AllocMode, BufferGuard, BufferHandle, BufferPool, BufferState, PoolStats};
pub use registry::{BufferPools, PoolPlan};

use serde::{Deserialize, Serialize};

/// What a pool's buffers carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolRole {
    /// Pure bayer from the sensor front-end
    Sensor,
    /// Processed bayer from the 3AA capture node
    DirtyBayer,
    /// 3AA output feeding a memory-to-memory ISP
    ThreeAa,
    /// ISP YUV output
    Isp,
    /// Stabilized output from the TPU
    Tpu,
    /// Preview scaler output
    Scaler,
    /// Full-size still YUV
    Picture,
    Recording,
    Jpeg,
    /// Face-detection working buffers
    Vra,
    /// Sensor output in vision mode
    Vision,
}

impl PoolRole {
    pub const ALL: [PoolRole; 11] = [
        PoolRole::Sensor,
        PoolRole::DirtyBayer,
        PoolRole::ThreeAa,
        PoolRole::Isp,
        PoolRole::Tpu,
        PoolRole::Scaler,
        PoolRole::Picture,
        PoolRole::Recording,
        PoolRole::Jpeg,
        PoolRole::Vra,
        PoolRole::Vision,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PoolRole::Sensor => "sensor",
            PoolRole::DirtyBayer => "bayer",
            PoolRole::ThreeAa => "3aa",
            PoolRole::Isp => "isp",
            PoolRole::Tpu => "tpu",
            PoolRole::Scaler => "scaler",
            PoolRole::Picture => "picture",
            PoolRole::Recording => "recording",
            PoolRole::Jpeg => "jpeg",
            PoolRole::Vra => "vra",
            PoolRole::Vision => "vision",
        }
    }
}

impl std::fmt::Display for PoolRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
