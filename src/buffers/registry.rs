// SPDX-License-Identifier: GPL-3.0-only

//! Pool registry sized from the capture configuration

use super::{AllocMode, BufferPool, PoolRole, PoolStats};
use crate::backends::{MemoryBackend, PixelFormat, Size};
use crate::config::CaptureConfig;
use crate::constants::buffers::META_PLANE_SIZE;
use crate::errors::{PipelineError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Allocation parameters for one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPlan {
    pub format: PixelFormat,
    pub size: Size,
    pub min_count: usize,
    pub max_count: usize,
    pub mode: AllocMode,
}

impl PoolPlan {
    /// Plan for a role under the given configuration
    ///
    /// Streaming pools are backed up front; still and recording pools are
    /// backed on demand beyond their first buffer.
    pub fn for_role(role: PoolRole, config: &CaptureConfig) -> Self {
        let counts = config.scaled_buffers();
        let geometry = &config.geometry;
        let (format, size, count) = match role {
            PoolRole::Sensor => (PixelFormat::Bayer12Packed, geometry.sensor, counts.sensor),
            PoolRole::DirtyBayer => (PixelFormat::Bayer16, geometry.sensor, counts.bayer),
            PoolRole::ThreeAa => (PixelFormat::Bayer16, geometry.sensor, counts.three_aa),
            PoolRole::Isp => (PixelFormat::Nv21, geometry.sensor, counts.isp),
            PoolRole::Tpu => (PixelFormat::Nv21, geometry.preview, counts.tpu),
            PoolRole::Scaler => (PixelFormat::Nv21, geometry.preview, counts.preview),
            PoolRole::Picture => (PixelFormat::Nv21, geometry.picture, counts.picture),
            PoolRole::Recording => (PixelFormat::Nv21, geometry.video, counts.recording),
            PoolRole::Jpeg => (PixelFormat::Jpeg, geometry.picture, counts.jpeg),
            PoolRole::Vra => (PixelFormat::Yuyv, geometry.preview, counts.vra),
            PoolRole::Vision => (PixelFormat::Bayer12Packed, geometry.preview, counts.sensor),
        };
        let mode = match role {
            PoolRole::Picture | PoolRole::Recording | PoolRole::Jpeg => AllocMode::OnDemand,
            _ => AllocMode::AtOnce,
        };
        Self {
            format,
            size,
            min_count: if mode == AllocMode::OnDemand { 1 } else { count },
            max_count: count,
            mode,
        }
    }

    /// Image planes followed by the metadata plane
    pub fn plane_sizes(&self) -> Vec<usize> {
        let mut sizes = self.format.plane_sizes(self.size);
        sizes.push(META_PLANE_SIZE);
        sizes
    }
}

/// Every pool of a session, one per role
pub struct BufferPools {
    /// Indexed by `PoolRole` discriminant
    pools: [Arc<BufferPool>; PoolRole::ALL.len()],
}

impl BufferPools {
    pub fn new(memory: Arc<dyn MemoryBackend>) -> Self {
        let pools = PoolRole::ALL.map(|role| BufferPool::new(role.name(), Arc::clone(&memory)));
        Self { pools }
    }

    pub fn get(&self, role: PoolRole) -> Arc<BufferPool> {
        Arc::clone(&self.pools[role as usize])
    }

    fn iter(&self) -> impl Iterator<Item = (PoolRole, &Arc<BufferPool>)> {
        PoolRole::ALL.into_iter().zip(self.pools.iter())
    }

    /// Allocate the pools for `roles`
    ///
    /// Already allocated pools are left alone. On failure, pools allocated by
    /// this call are released again before the error is returned.
    pub fn allocate(&self, config: &CaptureConfig, roles: &[PoolRole]) -> Result<()> {
        let mut allocated = Vec::new();
        for &role in roles {
            let pool = self.get(role);
            if pool.is_allocated() {
                continue;
            }
            let plan = PoolPlan::for_role(role, config);
            let result = pool.alloc(&plan.plane_sizes(), plan.min_count, plan.max_count, plan.mode);
            if let Err(e) = result {
                for done in allocated {
                    if let Err(e) = self.get(done).deinit() {
                        warn!(pool = %done, error = %e, "Rollback failed to release pool");
                    }
                }
                return Err(e);
            }
            allocated.push(role);
        }
        if !allocated.is_empty() {
            info!(pools = ?allocated, "Allocated buffer pools");
        }
        Ok(())
    }

    pub fn allocated_roles(&self) -> Vec<PoolRole> {
        self.iter()
            .filter(|(_, pool)| pool.is_allocated())
            .map(|(role, _)| role)
            .collect()
    }

    pub fn stats(&self) -> BTreeMap<PoolRole, PoolStats> {
        self.iter()
            .filter(|(_, pool)| pool.is_allocated())
            .map(|(role, pool)| (role, pool.stats()))
            .collect()
    }

    /// No allocated pool has a buffer checked out
    pub fn all_returned(&self) -> bool {
        self.pools
            .iter()
            .all(|pool| pool.available() == pool.capacity())
    }

    /// Force every slot back to FREE; returns how many were reclaimed
    pub fn reset_all(&self) -> usize {
        self.pools.iter().map(|pool| pool.reset()).sum()
    }

    /// Release every pool's memory
    ///
    /// Keeps going past failures and reports the first one.
    pub fn deinit_all(&self) -> Result<()> {
        let mut first_error: Option<PipelineError> = None;
        for (role, pool) in self.iter() {
            if let Err(e) = pool.deinit() {
                warn!(pool = %role, error = %e, "Failed to release pool");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for BufferPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPools")
            .field("allocated", &self.allocated_roles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::HeapMemory;
    use crate::constants::SpeedProfile;
    use crate::constants::buffers;

    #[test]
    fn test_plan_appends_meta_plane() {
        let config = CaptureConfig::compact();
        let plan = PoolPlan::for_role(PoolRole::Scaler, &config);
        let sizes = plan.plane_sizes();
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes.last(), Some(&META_PLANE_SIZE));
        assert_eq!(plan.max_count, buffers::NUM_PREVIEW_BUFFERS);
    }

    #[test]
    fn test_plan_follows_speed_profile() {
        let mut config = CaptureConfig::compact();
        config.speed = SpeedProfile::Fps120;
        let plan = PoolPlan::for_role(PoolRole::Sensor, &config);
        assert_eq!(plan.max_count, buffers::NUM_SENSOR_BUFFERS * 3);
        let picture = PoolPlan::for_role(PoolRole::Picture, &config);
        assert_eq!(picture.mode, AllocMode::OnDemand);
        assert_eq!(picture.max_count, buffers::NUM_PICTURE_BUFFERS);
    }

    #[test]
    fn test_allocate_and_release() {
        let memory = Arc::new(HeapMemory::new());
        let pools = BufferPools::new(memory.clone());
        let config = CaptureConfig::compact();
        pools
            .allocate(&config, &[PoolRole::Sensor, PoolRole::Scaler])
            .unwrap();
        assert_eq!(pools.allocated_roles(), vec![PoolRole::Sensor, PoolRole::Scaler]);
        assert!(pools.all_returned());

        let handle = pools.get(PoolRole::Sensor).get().unwrap();
        assert!(!pools.all_returned());
        assert!(pools.deinit_all().is_err());
        handle.put().unwrap();

        pools.deinit_all().unwrap();
        assert_eq!(memory.live_allocations(), 0);
    }

    #[test]
    fn test_allocation_failure_rolls_back() {
        // Room for the face-detection pool but not the sensor ring
        let memory = Arc::new(HeapMemory::with_limit(100_000));
        let pools = BufferPools::new(memory.clone());
        let config = CaptureConfig::compact();
        let result = pools.allocate(&config, &[PoolRole::Vra, PoolRole::Sensor]);
        assert!(matches!(result, Err(PipelineError::Allocation { .. })));
        assert!(pools.allocated_roles().is_empty());
        assert_eq!(memory.live_allocations(), 0);
    }
}
