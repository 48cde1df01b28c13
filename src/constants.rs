// SPDX-License-Identifier: GPL-3.0-only

//! Engine-wide constants
//!
//! Retry counts and intervals here were tuned against real sensor latency and
//! are kept as-is. `TimingConfig` can override them per capture mode.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sensor speed profile
///
/// Higher frame rates need deeper buffer rings so the sensor never starves
/// while downstream stages are still busy with earlier frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpeedProfile {
    /// Regular 30fps preview and recording
    #[default]
    Normal,
    /// 60fps high-speed recording
    Fps60,
    /// 120fps high-speed recording
    Fps120,
    /// 240fps high-speed recording
    Fps240,
}

impl SpeedProfile {
    /// All profiles, slowest first
    pub const ALL: [SpeedProfile; 4] = [
        SpeedProfile::Normal,
        SpeedProfile::Fps60,
        SpeedProfile::Fps120,
        SpeedProfile::Fps240,
    ];

    /// Get display name for the profile
    pub fn display_name(&self) -> &'static str {
        match self {
            SpeedProfile::Normal => "Normal",
            SpeedProfile::Fps60 => "60 fps",
            SpeedProfile::Fps120 => "120 fps",
            SpeedProfile::Fps240 => "240 fps",
        }
    }

    /// Nominal sensor frame rate
    pub fn fps(&self) -> u32 {
        match self {
            SpeedProfile::Normal => 30,
            SpeedProfile::Fps60 => 60,
            SpeedProfile::Fps120 => 120,
            SpeedProfile::Fps240 => 240,
        }
    }

    /// Scale a streaming buffer count (sensor, bayer, ISP, preview, recording)
    ///
    /// `fps60_extra` is the fixed headroom added in 60fps mode; faster modes
    /// triple the base count instead.
    pub fn scale_count(&self, base: usize, fps60_extra: usize) -> usize {
        match self {
            SpeedProfile::Normal => base,
            SpeedProfile::Fps60 => base + fps60_extra,
            SpeedProfile::Fps120 | SpeedProfile::Fps240 => base * 3,
        }
    }

    /// Scale a pipe prepare depth
    pub fn scale_prepare(&self, base: usize) -> usize {
        match self {
            SpeedProfile::Normal => base,
            SpeedProfile::Fps60 => base * 2,
            SpeedProfile::Fps120 | SpeedProfile::Fps240 => base * 3,
        }
    }
}

/// Buffer layout limits
pub mod buffers {
    /// Image planes plus one metadata plane
    pub const MAX_PLANES: usize = 5;

    /// Size of the per-buffer metadata plane
    pub const META_PLANE_SIZE: usize = 32 * 1024;

    /// Bayer buffers kept back for reprocessing
    pub const REPROCESSING_BAYER_HOLD_COUNT: usize = 1;

    pub const NUM_SENSOR_BUFFERS: usize = 4 + REPROCESSING_BAYER_HOLD_COUNT;
    pub const NUM_BAYER_BUFFERS: usize = 4 + REPROCESSING_BAYER_HOLD_COUNT;
    pub const NUM_3AA_BUFFERS: usize = NUM_BAYER_BUFFERS;
    pub const NUM_ISP_BUFFERS: usize = NUM_3AA_BUFFERS;
    pub const NUM_PREVIEW_BUFFERS: usize = 9 + 3;
    pub const NUM_PICTURE_BUFFERS: usize = 5;
    pub const NUM_RECORDING_BUFFERS: usize = 8;
    pub const NUM_JPEG_BUFFERS: usize = 4;
    pub const NUM_VRA_BUFFERS: usize = 2;

    /// Fixed headroom added to streaming pools in 60fps mode
    pub const FPS60_SENSOR_EXTRA: usize = 5;
    pub const FPS60_PREVIEW_EXTRA: usize = 7;
    pub const FPS60_RECORDING_EXTRA: usize = 5;
}

/// Pipe prepare depths (buffers queued to a device ahead of dequeue)
pub mod prepare {
    pub const FLITE: usize = 3;
    pub const THREE_AC: usize = 3;
    pub const THREE_AA_ISP: usize = 3;
    pub const ISP: usize = 1;
    pub const SCC: usize = 1;
    pub const SCP: usize = 3;
    pub const REPROCESSING: usize = 1;

    /// Frames generated ahead before the feeder waits for completions
    pub const NUM_FRAME_PREPARE_COUNT: usize = 6;
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Poll interval for bounded buffer and queue retries
    pub const WAITING_TIME: Duration = Duration::from_millis(5);

    /// Retries for ordinary hold-list selection
    pub const TOTAL_WAITING_COUNT: u32 = 3;

    /// Retries while waiting for the main-flash frame
    pub const TOTAL_FLASH_WAITING_COUNT: u32 = 10;

    /// Retries while waiting for AE convergence in HDR bracketing
    pub const HDR_RETRY_COUNT: u32 = 15;

    /// Retries while waiting for a focused frame
    pub const CAPTURE_WAITING_COUNT: u32 = 15;

    /// Sleep between focus-wait retries
    pub const DM_WAITING_TIME: Duration = Duration::from_millis(30);

    /// Generation attempts before a feeder tick is skipped
    pub const GENERATE_FRAME_RETRY: u32 = 10;

    /// Upper bound a capture waits on the hold list overall
    pub const SELECTOR_HOLD_WAIT: Duration = Duration::from_secs(2);

    /// Worker queue wait before looping back to check the stop flag
    pub const QUEUE_WAIT: Duration = Duration::from_millis(50);

    /// Device dequeue wait per poll
    pub const DEQUEUE_WAIT: Duration = Duration::from_millis(100);

    /// Consecutive blocked dequeues before the watchdog escalates
    pub const ERROR_DQ_BLOCKED_COUNT: u32 = 20;

    /// Stage interval that triggers a watchdog warning
    pub const WARNING_STAGE_INTERVAL: Duration = Duration::from_millis(100);

    /// Watchdog sampling period
    pub const MONITOR_INTERVAL: Duration = Duration::from_millis(200);

    /// Frame counter modulo for periodic logging
    pub const LOG_EVERY_N_FRAMES: u64 = 30;
}

/// Frame skip counts applied when a stream (re)starts
pub mod skip {
    /// Preview frames completed but not delivered while AE settles
    pub const INITIAL_SKIP_FRAME: u32 = 8;
    pub const FRAME_SKIP_COUNT_PREVIEW: u32 = 0;
    pub const FRAME_SKIP_COUNT_RECORDING: u32 = 1;
}

/// Worker pool sizes
pub mod workers {
    /// JPEG save workers draining the picture output
    pub const JPEG_SAVE_THREADS: usize = 2;
}
