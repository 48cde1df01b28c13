// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use camera_pipeline::config::TimingConfig;
use camera_pipeline::constants::{SpeedProfile, buffers, skip, timing};
use std::time::Duration;

#[test]
fn test_speed_profiles_ordered() {
    // Profiles are listed slowest first
    let mut prev_fps = 0;
    for profile in SpeedProfile::ALL {
        assert!(profile.fps() > prev_fps, "{} out of order", profile.display_name());
        prev_fps = profile.fps();
    }
}

#[test]
fn test_faster_profiles_never_shrink_rings() {
    let base = buffers::NUM_SENSOR_BUFFERS;
    let mut prev = 0;
    for profile in SpeedProfile::ALL {
        let count = profile.scale_count(base, buffers::FPS60_SENSOR_EXTRA);
        assert!(count >= prev);
        assert!(profile.scale_prepare(1) >= 1);
        prev = count;
    }
}

#[test]
fn test_timing_defaults_match_constants() {
    let timing_config = TimingConfig::default();
    assert_eq!(timing_config.waiting_time(), timing::WAITING_TIME);
    assert_eq!(timing_config.dm_waiting_time(), timing::DM_WAITING_TIME);
    assert_eq!(timing_config.selector_hold_wait(), timing::SELECTOR_HOLD_WAIT);
    assert_eq!(timing_config.monitor_interval(), timing::MONITOR_INTERVAL);
    assert_eq!(timing_config.warning_stage_interval(), timing::WARNING_STAGE_INTERVAL);
    assert_eq!(timing_config.total_waiting_count, timing::TOTAL_WAITING_COUNT);
    assert_eq!(timing_config.error_dq_blocked_count, timing::ERROR_DQ_BLOCKED_COUNT);
}

#[test]
fn test_tuned_values() {
    assert_eq!(timing::WAITING_TIME, Duration::from_millis(5));
    assert_eq!(timing::SELECTOR_HOLD_WAIT, Duration::from_secs(2));
    assert_eq!(timing::GENERATE_FRAME_RETRY, 10);
    assert_eq!(buffers::MAX_PLANES, 5);
    assert_eq!(buffers::META_PLANE_SIZE, 32 * 1024);
    assert_eq!(skip::INITIAL_SKIP_FRAME, 8);
    assert_eq!(skip::FRAME_SKIP_COUNT_PREVIEW, 0);
    assert_eq!(skip::FRAME_SKIP_COUNT_RECORDING, 1);
}

#[test]
fn test_retry_budgets_fit_the_hold_wait() {
    // Every retrying policy gives up before the overall hold wait expires
    let poll = timing::WAITING_TIME;
    for retries in [
        timing::TOTAL_WAITING_COUNT,
        timing::TOTAL_FLASH_WAITING_COUNT,
        timing::HDR_RETRY_COUNT,
    ] {
        assert!(poll * retries < timing::SELECTOR_HOLD_WAIT);
    }
    assert!(timing::DM_WAITING_TIME * timing::CAPTURE_WAITING_COUNT < timing::SELECTOR_HOLD_WAIT);
}
