// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the capture-mode descriptor

use camera_pipeline::buffers::PoolPlan;
use camera_pipeline::config::CaptureConfig;
use camera_pipeline::constants::SpeedProfile;
use camera_pipeline::factory::{FactoryKind, Topology};
use camera_pipeline::{PipeId, PipelineError, PoolRole};
use tempfile::TempDir;

#[test]
fn test_config_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = CaptureConfig::compact();
    config.speed = SpeedProfile::Fps60;
    config.bayer.dynamic = true;
    config.options.face_detection = true;
    config.timing.selector_hold_wait_ms = 750;
    config.save(&path).unwrap();

    let loaded = CaptureConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_missing_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let loaded = CaptureConfig::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(loaded, CaptureConfig::default());
}

#[test]
fn test_malformed_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "speed = [1, 2").unwrap();
    assert!(matches!(
        CaptureConfig::load(&path),
        Err(PipelineError::TomlDe(_))
    ));
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "jpeg_save_threads = 0\n").unwrap();
    assert!(matches!(
        CaptureConfig::load(&path),
        Err(PipelineError::Config(_))
    ));
}

#[test]
fn test_vision_runs_without_reprocessing() {
    let mut config = CaptureConfig::default();
    config.options.vision = true;
    let normalized = config.normalized();
    assert!(!normalized.bayer.reprocessing);

    let topology = Topology::for_kind(FactoryKind::Vision, &normalized);
    assert_eq!(topology.pool_roles(), vec![PoolRole::Vision]);
}

#[test]
fn test_preview_variant_follows_options() {
    let mut config = CaptureConfig::default();
    assert_eq!(FactoryKind::preview_variant(&config), FactoryKind::ThreeAaIspOtf);

    config.options.three_aa_isp_otf = false;
    config.options.tpu_stabilization = true;
    assert_eq!(FactoryKind::preview_variant(&config), FactoryKind::ThreeAaIspM2mTpu);

    config.options.nv21_picture = true;
    assert_eq!(FactoryKind::reprocessing_variant(&config), FactoryKind::ReprocessingNv21);
}

#[test]
fn test_dirty_bayer_topology_holds_three_ac() {
    let mut config = CaptureConfig::default();
    config.bayer.pure = false;
    let config = config.normalized();
    let topology = Topology::for_kind(FactoryKind::Preview, &config);
    assert!(topology.contains(PipeId::ThreeAc));
    assert!(topology.pool_roles().contains(&PoolRole::DirtyBayer));
}

#[test]
fn test_pool_plans_follow_speed_profile() {
    let mut config = CaptureConfig::default();
    let normal = PoolPlan::for_role(PoolRole::Sensor, &config);
    config.speed = SpeedProfile::Fps240;
    let fast = PoolPlan::for_role(PoolRole::Sensor, &config);
    assert_eq!(fast.max_count, normal.max_count * 3);
    assert_eq!(fast.min_count, fast.max_count);

    let picture = PoolPlan::for_role(PoolRole::Picture, &config);
    assert_eq!(picture.max_count, config.buffers.picture);
    assert_eq!(picture.min_count, 1);
}
