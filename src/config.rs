// SPDX-License-Identifier: GPL-3.0-only

//! Capture-mode descriptor
//!
//! Everything the engine needs to size pools, pick factories and tune retry
//! loops. Stored as TOML; a missing file or field falls back to defaults.

use crate::backends::Size;
use crate::constants::{SpeedProfile, buffers, prepare, skip, timing, workers};
use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const CONFIG_DIR: &str = "camera-pipeline";
const CONFIG_FILE: &str = "config.toml";

/// Current on-disk layout version
pub const CONFIG_VERSION: u32 = 1;

/// Stream sizes per output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    /// Full sensor readout
    pub sensor: Size,
    pub preview: Size,
    pub picture: Size,
    pub video: Size,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            sensor: Size::new(2576, 1932),
            preview: Size::new(1280, 720),
            picture: Size::new(2560, 1920),
            video: Size::new(1920, 1080),
        }
    }
}

/// Base buffer counts per pool role, before speed-profile scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferCounts {
    pub sensor: usize,
    pub bayer: usize,
    pub three_aa: usize,
    pub isp: usize,
    pub tpu: usize,
    pub preview: usize,
    pub picture: usize,
    pub recording: usize,
    pub jpeg: usize,
    pub vra: usize,
}

impl Default for BufferCounts {
    fn default() -> Self {
        Self {
            sensor: buffers::NUM_SENSOR_BUFFERS,
            bayer: buffers::NUM_BAYER_BUFFERS,
            three_aa: buffers::NUM_3AA_BUFFERS,
            isp: buffers::NUM_ISP_BUFFERS,
            tpu: buffers::NUM_ISP_BUFFERS,
            preview: buffers::NUM_PREVIEW_BUFFERS,
            picture: buffers::NUM_PICTURE_BUFFERS,
            recording: buffers::NUM_RECORDING_BUFFERS,
            jpeg: buffers::NUM_JPEG_BUFFERS,
            vra: buffers::NUM_VRA_BUFFERS,
        }
    }
}

impl BufferCounts {
    /// Counts after applying a speed profile
    ///
    /// Picture, JPEG and face-detection pools never scale.
    pub fn scaled(&self, profile: SpeedProfile) -> Self {
        Self {
            sensor: profile.scale_count(self.sensor, buffers::FPS60_SENSOR_EXTRA),
            bayer: profile.scale_count(self.bayer, buffers::FPS60_SENSOR_EXTRA),
            three_aa: profile.scale_count(self.three_aa, buffers::FPS60_SENSOR_EXTRA),
            isp: profile.scale_count(self.isp, buffers::FPS60_SENSOR_EXTRA),
            tpu: profile.scale_count(self.tpu, buffers::FPS60_SENSOR_EXTRA),
            preview: profile.scale_count(self.preview, buffers::FPS60_PREVIEW_EXTRA),
            recording: profile.scale_count(self.recording, buffers::FPS60_RECORDING_EXTRA),
            ..*self
        }
    }

    fn fields(&self) -> [(&'static str, usize); 10] {
        [
            ("sensor", self.sensor),
            ("bayer", self.bayer),
            ("three_aa", self.three_aa),
            ("isp", self.isp),
            ("tpu", self.tpu),
            ("preview", self.preview),
            ("picture", self.picture),
            ("recording", self.recording),
            ("jpeg", self.jpeg),
            ("vra", self.vra),
        ]
    }
}

/// Buffers a pipe keeps queued in its device ahead of dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepareDepths {
    pub flite: usize,
    pub three_ac: usize,
    pub three_aa_isp: usize,
    pub isp: usize,
    pub scp: usize,
    pub scc: usize,
    pub reprocessing: usize,
}

impl Default for PrepareDepths {
    fn default() -> Self {
        Self {
            flite: prepare::FLITE,
            three_ac: prepare::THREE_AC,
            three_aa_isp: prepare::THREE_AA_ISP,
            isp: prepare::ISP,
            scp: prepare::SCP,
            scc: prepare::SCC,
            reprocessing: prepare::REPROCESSING,
        }
    }
}

impl PrepareDepths {
    /// Depths after applying a speed profile; reprocessing never scales
    pub fn scaled(&self, profile: SpeedProfile) -> Self {
        Self {
            flite: profile.scale_prepare(self.flite),
            three_ac: profile.scale_prepare(self.three_ac),
            three_aa_isp: profile.scale_prepare(self.three_aa_isp),
            isp: profile.scale_prepare(self.isp),
            scp: profile.scale_prepare(self.scp),
            scc: profile.scale_prepare(self.scc),
            reprocessing: self.reprocessing,
        }
    }
}

/// Raw buffer hold strategy for still capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayerConfig {
    /// Stills are produced by reprocessing a held bayer buffer
    pub reprocessing: bool,
    /// Hold bayer frames only after a capture trigger
    pub dynamic: bool,
    /// Hold the sensor (pure) bayer rather than the 3AA (dirty) output
    pub pure: bool,
    pub hold_count: usize,
    /// Re-arm frames already in flight at the bayer stage on trigger
    pub boost_dynamic_capture: bool,
    /// Frames flagged for holding per dynamic trigger, on top of the shot count
    pub dynamic_arm_margin: u32,
}

impl Default for BayerConfig {
    fn default() -> Self {
        Self {
            reprocessing: true,
            dynamic: false,
            pure: true,
            hold_count: buffers::REPROCESSING_BAYER_HOLD_COUNT,
            boost_dynamic_capture: false,
            dynamic_arm_margin: 1,
        }
    }
}

/// Optional graph features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// 3AA and ISP chained on-the-fly instead of memory-to-memory
    pub three_aa_isp_otf: bool,
    pub tpu_stabilization: bool,
    pub dual_preview: bool,
    pub vision: bool,
    pub face_detection: bool,
    /// Stills as NV21 from the reprocessing scaler instead of JPEG
    pub nv21_picture: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            three_aa_isp_otf: true,
            tpu_stabilization: false,
            dual_preview: false,
            vision: false,
            face_detection: false,
            nv21_picture: false,
        }
    }
}

/// Retry counts and intervals, overridable per capture mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub waiting_time_ms: u64,
    pub total_waiting_count: u32,
    pub flash_waiting_count: u32,
    pub hdr_retry_count: u32,
    pub capture_waiting_count: u32,
    pub dm_waiting_time_ms: u64,
    pub generate_frame_retry: u32,
    pub selector_hold_wait_ms: u64,
    pub queue_wait_ms: u64,
    pub dequeue_wait_ms: u64,
    pub error_dq_blocked_count: u32,
    pub warning_stage_interval_ms: u64,
    pub monitor_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            waiting_time_ms: timing::WAITING_TIME.as_millis() as u64,
            total_waiting_count: timing::TOTAL_WAITING_COUNT,
            flash_waiting_count: timing::TOTAL_FLASH_WAITING_COUNT,
            hdr_retry_count: timing::HDR_RETRY_COUNT,
            capture_waiting_count: timing::CAPTURE_WAITING_COUNT,
            dm_waiting_time_ms: timing::DM_WAITING_TIME.as_millis() as u64,
            generate_frame_retry: timing::GENERATE_FRAME_RETRY,
            selector_hold_wait_ms: timing::SELECTOR_HOLD_WAIT.as_millis() as u64,
            queue_wait_ms: timing::QUEUE_WAIT.as_millis() as u64,
            dequeue_wait_ms: timing::DEQUEUE_WAIT.as_millis() as u64,
            error_dq_blocked_count: timing::ERROR_DQ_BLOCKED_COUNT,
            warning_stage_interval_ms: timing::WARNING_STAGE_INTERVAL.as_millis() as u64,
            monitor_interval_ms: timing::MONITOR_INTERVAL.as_millis() as u64,
        }
    }
}

impl TimingConfig {
    pub fn waiting_time(&self) -> Duration {
        Duration::from_millis(self.waiting_time_ms)
    }

    pub fn dm_waiting_time(&self) -> Duration {
        Duration::from_millis(self.dm_waiting_time_ms)
    }

    pub fn selector_hold_wait(&self) -> Duration {
        Duration::from_millis(self.selector_hold_wait_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_millis(self.dequeue_wait_ms)
    }

    pub fn warning_stage_interval(&self) -> Duration {
        Duration::from_millis(self.warning_stage_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

/// Full capture-mode descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub version: u32,
    pub geometry: Geometry,
    pub speed: SpeedProfile,
    pub buffers: BufferCounts,
    pub prepare: PrepareDepths,
    pub bayer: BayerConfig,
    pub options: PipelineOptions,
    pub timing: TimingConfig,
    pub jpeg_save_threads: usize,
    /// Preview frames completed but not delivered after start
    pub initial_skip_frames: u32,
    /// Video frames dropped after recording starts
    pub recording_skip_frames: u32,
    /// Frames generated ahead of completion
    pub max_in_flight: usize,
    /// Minimum spacing between generated preview frames (0 = as fast as buffers allow)
    pub frame_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            geometry: Geometry::default(),
            speed: SpeedProfile::default(),
            buffers: BufferCounts::default(),
            prepare: PrepareDepths::default(),
            bayer: BayerConfig::default(),
            options: PipelineOptions::default(),
            timing: TimingConfig::default(),
            jpeg_save_threads: workers::JPEG_SAVE_THREADS,
            initial_skip_frames: skip::INITIAL_SKIP_FRAME,
            recording_skip_frames: skip::FRAME_SKIP_COUNT_RECORDING,
            max_in_flight: prepare::NUM_FRAME_PREPARE_COUNT,
            frame_interval_ms: 33,
        }
    }
}

impl CaptureConfig {
    /// Small geometry and zero pacing, for simulated sessions
    pub fn compact() -> Self {
        Self {
            geometry: Geometry {
                sensor: Size::new(64, 48),
                preview: Size::new(32, 24),
                picture: Size::new(64, 48),
                video: Size::new(32, 24),
            },
            initial_skip_frames: 0,
            frame_interval_ms: 0,
            ..Self::default()
        }
    }

    /// `<config dir>/camera-pipeline/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from a TOML file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        if config.version != CONFIG_VERSION {
            warn!(
                found = config.version,
                expected = CONFIG_VERSION,
                "Config version mismatch, missing fields use defaults"
            );
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults on any error
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        Self::load(&path).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            Self::default()
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        info!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject descriptors the engine cannot run
    pub fn validate(&self) -> Result<()> {
        for (name, count) in self.buffers.fields() {
            if count == 0 {
                return Err(PipelineError::Config(format!(
                    "buffer count for {} must be at least 1",
                    name
                )));
            }
        }
        if self.bayer.reprocessing && self.bayer.hold_count == 0 {
            return Err(PipelineError::Config(
                "reprocessing needs a bayer hold count of at least 1".to_string(),
            ));
        }
        if self.bayer.reprocessing && self.bayer.hold_count >= self.buffers.sensor {
            return Err(PipelineError::Config(format!(
                "bayer hold count {} leaves no sensor buffer for streaming ({} total)",
                self.bayer.hold_count, self.buffers.sensor
            )));
        }
        for size in [
            self.geometry.sensor,
            self.geometry.preview,
            self.geometry.picture,
            self.geometry.video,
        ] {
            if size.pixels() == 0 {
                return Err(PipelineError::Config(format!("empty stream size {}", size)));
            }
        }
        if self.jpeg_save_threads == 0 {
            return Err(PipelineError::Config(
                "at least one jpeg save worker is required".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(PipelineError::Config(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.timing.monitor_interval_ms == 0 || self.timing.queue_wait_ms == 0 {
            return Err(PipelineError::Config(
                "monitor and queue intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve conflicting options
    ///
    /// Dual preview and vision run without reprocessing; dirty bayer holds
    /// need the memory-to-memory graph. Returns the adjusted descriptor.
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        if config.options.dual_preview && config.bayer.reprocessing {
            warn!("Dual preview does not support reprocessing, disabling it");
            config.bayer.reprocessing = false;
        }
        if config.options.vision && config.bayer.reprocessing {
            info!("Vision mode captures no stills, disabling reprocessing");
            config.bayer.reprocessing = false;
        }
        if config.bayer.reprocessing && !config.bayer.pure && config.options.three_aa_isp_otf {
            info!("Dirty bayer hold selected, switching 3AA/ISP to memory-to-memory");
            config.options.three_aa_isp_otf = false;
        }
        config
    }

    /// Buffer counts for the active speed profile
    pub fn scaled_buffers(&self) -> BufferCounts {
        self.buffers.scaled(self.speed)
    }

    /// Prepare depths for the active speed profile
    pub fn scaled_prepare(&self) -> PrepareDepths {
        self.prepare.scaled(self.speed)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        CaptureConfig::default().validate().unwrap();
        CaptureConfig::compact().validate().unwrap();
    }

    #[test]
    fn test_fps60_scaling() {
        let mut config = CaptureConfig::default();
        config.speed = SpeedProfile::Fps60;
        let counts = config.scaled_buffers();
        assert_eq!(counts.sensor, buffers::NUM_SENSOR_BUFFERS + 5);
        assert_eq!(counts.preview, buffers::NUM_PREVIEW_BUFFERS + 7);
        assert_eq!(counts.recording, buffers::NUM_RECORDING_BUFFERS + 5);
        assert_eq!(counts.picture, buffers::NUM_PICTURE_BUFFERS);
        assert_eq!(config.scaled_prepare().flite, prepare::FLITE * 2);
        assert_eq!(config.scaled_prepare().reprocessing, prepare::REPROCESSING);
    }

    #[test]
    fn test_fps120_triples() {
        let mut config = CaptureConfig::default();
        config.speed = SpeedProfile::Fps120;
        let counts = config.scaled_buffers();
        assert_eq!(counts.sensor, buffers::NUM_SENSOR_BUFFERS * 3);
        assert_eq!(counts.jpeg, buffers::NUM_JPEG_BUFFERS);
    }

    #[test]
    fn test_zero_count_rejected() {
        let mut config = CaptureConfig::default();
        config.buffers.preview = 0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_hold_count_must_leave_streaming_buffers() {
        let mut config = CaptureConfig::default();
        config.bayer.hold_count = config.buffers.sensor;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dual_preview_downgrades_reprocessing() {
        let mut config = CaptureConfig::default();
        config.options.dual_preview = true;
        let normalized = config.normalized();
        assert!(!normalized.bayer.reprocessing);
    }

    #[test]
    fn test_dirty_bayer_forces_m2m() {
        let mut config = CaptureConfig::default();
        config.bayer.pure = false;
        assert!(!config.normalized().options.three_aa_isp_otf);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CaptureConfig = toml::from_str("speed = \"Fps60\"\n[bayer]\ndynamic = true\n").unwrap();
        assert_eq!(config.speed, SpeedProfile::Fps60);
        assert!(config.bayer.dynamic);
        assert!(config.bayer.reprocessing);
        assert_eq!(config.buffers, BufferCounts::default());
    }
}
