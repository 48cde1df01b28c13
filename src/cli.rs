// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands driving a simulated capture session
//!
//! This module provides command-line functionality for:
//! - Streaming preview frames
//! - Taking still pictures
//! - Recording video frames
//! - Inspecting the capture-mode descriptor

use camera_pipeline::backends::{CallbackEvent, ChannelCallbacks, HeapMemory, VirtualDevice};
use camera_pipeline::engine::SessionStats;
use camera_pipeline::{CaptureConfig, CaptureIntent, CaptureSession, StopReport};
use chrono::Local;
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Frame pacing of the built-in simulated mode
const SIMULATED_FRAME_INTERVAL_MS: u64 = 10;

/// How long a command waits for the pipeline before giving up
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

/// Selection hints for `capture`
#[derive(Debug, Clone, Copy)]
pub struct Trigger {
    pub hdr: bool,
    pub flash: bool,
    pub dynamic: bool,
}

/// Load the descriptor from `path`, or use the compact simulated mode
pub fn load_config(path: Option<&Path>) -> Result<CaptureConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(CaptureConfig::load(path)?),
        None => Ok(CaptureConfig {
            frame_interval_ms: SIMULATED_FRAME_INTERVAL_MS,
            ..CaptureConfig::compact()
        }),
    }
}

/// Session over the simulated device, with callbacks forwarded to a channel
fn open_session(
    config: CaptureConfig,
) -> Result<(CaptureSession, Receiver<CallbackEvent>), Box<dyn std::error::Error>> {
    let (callbacks, events) = ChannelCallbacks::new();
    let session = CaptureSession::new(
        Arc::new(VirtualDevice::new()),
        Arc::new(HeapMemory::new()),
        Arc::new(callbacks),
        config,
    )?;
    Ok((session, events))
}

/// Flag set by Ctrl+C
fn interrupt_flag() -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(interrupted)
}

/// Sleep in small steps until `done`, an interrupt or the timeout
fn wait(interrupted: &AtomicBool, timeout: Duration, done: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if interrupted.load(Ordering::SeqCst) {
            println!();
            println!("Stopping early...");
            return false;
        }
        if start.elapsed() > timeout {
            return false;
        }
        thread::sleep(POLL);
    }
    true
}

/// Stream `frames` preview frames
pub fn run_preview(config: CaptureConfig, frames: u64, output: Output) -> CliResult {
    let interrupted = interrupt_flag()?;
    let (session, events) = open_session(config)?;
    session.set_frame_limit(Some(frames));
    session.start_preview()?;

    if !output.json {
        println!("Streaming {} frames (press Ctrl+C to stop early)...", frames);
    }
    let finished = wait(&interrupted, COMMAND_TIMEOUT, || {
        session.context().frames().finished() >= frames
    });
    if !finished && !interrupted.load(Ordering::SeqCst) {
        eprintln!("Timed out waiting for preview frames");
    }

    let stats = session.stats();
    let report = session.stop_preview()?;
    let errors = drain_errors(&events);
    print_report(&stats, &report, errors, output)
}

/// Take a still-capture sequence from a running preview
pub fn take_pictures(mut config: CaptureConfig, shots: u32, trigger: Trigger, output: Output) -> CliResult {
    if trigger.dynamic {
        config.bayer.dynamic = true;
    }
    let interrupted = interrupt_flag()?;
    let (session, events) = open_session(config.clone())?;
    session.start_preview()?;

    // Let the hold list fill before triggering
    let warmup = config.bayer.hold_count as u64 + 1;
    wait(&interrupted, COMMAND_TIMEOUT, || {
        session.context().frames().completed >= warmup
    });

    let next = session.context().snapshot().frames.generated as u32 + 1;
    let intent = CaptureIntent {
        flash_fcount: trigger.flash.then_some(next),
        hdr_trigger: trigger.hdr.then_some(next),
        ..CaptureIntent::default()
    };
    let seq = session.take_picture(shots, intent)?;
    if !output.json {
        println!("Capture {} requested: {} shot(s)", seq, shots);
    }
    wait(&interrupted, COMMAND_TIMEOUT, || {
        session.context().callbacks().picture >= u64::from(shots)
    });
    if !session.wait_capture_idle(COMMAND_TIMEOUT) {
        eprintln!("Capture sequence did not finish");
    }

    let stats = session.stats();
    let report = session.stop_preview()?;
    let mut pictures = Vec::new();
    let mut errors = Vec::new();
    for event in events.try_iter() {
        match event {
            CallbackEvent::Picture { fcount, bytes } => pictures.push((fcount, bytes)),
            CallbackEvent::Error(code) => errors.push(format!("{:?}", code)),
            _ => {}
        }
    }
    if !output.json {
        for (fcount, bytes) in &pictures {
            println!("  picture from frame {} ({} bytes)", fcount, bytes);
        }
    }
    print_report(&stats, &report, errors, output)
}

/// Record video frames for `seconds`
pub fn record(config: CaptureConfig, seconds: u64, output: Output) -> CliResult {
    let interrupted = interrupt_flag()?;
    let (session, events) = open_session(config)?;
    session.start_preview()?;
    session.start_recording()?;
    if !output.json {
        println!("Recording for {} seconds (press Ctrl+C to stop early)...", seconds);
    }

    let until = Instant::now() + Duration::from_secs(seconds);
    wait(&interrupted, Duration::from_secs(seconds + 1), || Instant::now() >= until);
    session.stop_recording()?;

    let stats = session.stats();
    let report = session.stop_preview()?;
    let errors = drain_errors(&events);
    print_report(&stats, &report, errors, output)
}

/// Print the descriptor, or write it to its config path
pub fn show_config(config: &CaptureConfig, path: Option<PathBuf>, write: bool) -> CliResult {
    if !write {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    let path = path
        .or_else(CaptureConfig::default_path)
        .ok_or("No config directory available")?;
    config.save(&path)?;
    println!("Config written: {}", path.display());
    Ok(())
}

fn drain_errors(events: &Receiver<CallbackEvent>) -> Vec<String> {
    events
        .try_iter()
        .filter_map(|event| match event {
            CallbackEvent::Error(code) => Some(format!("{:?}", code)),
            _ => None,
        })
        .collect()
}

fn print_report(stats: &SessionStats, report: &StopReport, errors: Vec<String>, output: Output) -> CliResult {
    if output.json {
        let document = serde_json::json!({
            "stats": stats,
            "stop": report,
            "errors": errors,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    let ctx = &stats.context;
    let started = ctx.started_at.with_timezone(&Local);
    println!();
    println!("Session {}", ctx.session_id);
    println!("  started      {}", started.format("%Y-%m-%d %H:%M:%S"));
    println!("  mode         {}", stats.mode);
    println!("  uptime       {:.2}s", ctx.uptime_ms as f64 / 1000.0);
    println!();
    println!("Frames");
    println!("  generated    {}", ctx.frames.generated);
    println!("  completed    {}", ctx.frames.completed);
    println!("  skipped      {}", ctx.frames.skipped);
    println!("  errored      {}", ctx.frames.errored);
    println!("  gen. skips   {}", ctx.frames.generation_skips);
    println!("  preview fps  {:.1}", ctx.preview_fps);
    println!();
    println!("Callbacks");
    println!("  preview      {}", ctx.callbacks.preview);
    println!("  video        {}", ctx.callbacks.video);
    println!("  shutter      {}", ctx.callbacks.shutter);
    println!("  picture      {}", ctx.callbacks.picture);
    println!("  metadata     {}", ctx.callbacks.metadata);
    println!("  error        {}", ctx.callbacks.error);
    println!();
    println!("Pools");
    println!(
        "  {:<12} {:>8} {:>8} {:>8} {:>8}",
        "role", "capacity", "acquired", "misses", "in use"
    );
    for (role, pool) in &stats.pools {
        println!(
            "  {:<12} {:>8} {:>8} {:>8} {:>8}",
            role.name(),
            pool.capacity,
            pool.acquisitions,
            pool.misses,
            pool.in_use
        );
    }
    println!();
    println!(
        "Stop: {} drained, {} aborted, {} queued, {} purged, {} leaked buffers",
        report.drained, report.aborted, report.queued, report.purged, report.leaked_buffers
    );
    for error in &errors {
        println!("Error reported: {}", error);
    }
    Ok(())
}
