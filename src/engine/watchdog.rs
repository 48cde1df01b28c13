// SPDX-License-Identifier: GPL-3.0-only

//! Stage monitor
//!
//! Samples every stage's health at the monitor interval. A stage that sits
//! on device buffers without progress is logged; a device fault, or a stage
//! whose dequeues stay blocked past the error threshold, faults the session.

use super::runtime::Runtime;
use super::state::SessionState;
use super::worker::{LoopAction, WorkerController};
use crate::config::TimingConfig;
use crate::errors::{HostErrorCode, Result};
use crate::pipes::{FrameQueue, Popped, StageHealth};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, warn};

/// Verdict of one health sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Busy stages without recent progress
    Slow(Vec<String>),
    Fault { stage: String, reason: String },
}

/// Judge a set of stage health samples against the configured thresholds
pub fn assess(health: &[StageHealth], timing: &TimingConfig) -> Verdict {
    let mut slow = Vec::new();
    for stage in health.iter().filter(|s| s.running) {
        if let Some(reason) = &stage.fault {
            return Verdict::Fault {
                stage: stage.pipe.to_string(),
                reason: reason.clone(),
            };
        }
        if stage.dq_blocked > timing.error_dq_blocked_count {
            return Verdict::Fault {
                stage: stage.pipe.to_string(),
                reason: format!("{} consecutive blocked dequeues", stage.dq_blocked),
            };
        }
        if stage.is_busy() && stage.since_progress > timing.warning_stage_interval() {
            slow.push(stage.pipe.to_string());
        }
    }
    if slow.is_empty() { Verdict::Healthy } else { Verdict::Slow(slow) }
}

/// Start the monitor thread
pub fn start(rt: Arc<Runtime>) -> Result<WorkerController> {
    let tick: FrameQueue<()> = FrameQueue::new("watchdog-tick");
    let waker = tick.clone();
    let interval = rt.config.timing.monitor_interval();

    WorkerController::start("watchdog", move || {
        if !matches!(tick.wait_and_pop(interval), Popped::TimedOut) {
            return LoopAction::Continue;
        }
        if rt.is_stopping() {
            return LoopAction::Stop;
        }
        let mut health = rt.stream.health();
        if let Some(graph) = &rt.reprocessing {
            health.extend(graph.health());
        }
        match assess(&health, &rt.config.timing) {
            Verdict::Healthy => LoopAction::Continue,
            Verdict::Slow(stages) => {
                warn!(stages = ?stages, "Stages slow to complete");
                LoopAction::Continue
            }
            Verdict::Fault { stage, reason } => {
                escalate(&rt, &stage, &reason);
                LoopAction::Stop
            }
        }
    })
    .map(|worker| worker.with_waker(move || waker.wake_up()))
}

/// Fault the session: notify the host and stop the graphs
fn escalate(rt: &Runtime, stage: &str, reason: &str) {
    error!(stage, reason, "Stage fault, session faulted");
    rt.faulted.store(true, Ordering::SeqCst);
    {
        let mut state = rt.lock_state();
        if let Err(e) = state.transition(SessionState::Faulted, "watchdog") {
            warn!(error = %e, "Session could not enter faulted state");
        }
    }
    rt.report_error(HostErrorCode::DeviceFault);

    let mut drained = rt.stream.stop();
    if let Some(graph) = &rt.reprocessing {
        drained.extend(graph.stop());
    }
    for id in drained {
        rt.abort_frame(id);
        rt.release(id, "fault drain");
    }
    rt.selector.cancel_picture();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipes::PipeId;
    use std::time::Duration;

    fn sample(pipe: PipeId) -> StageHealth {
        StageHealth {
            pipe,
            running: true,
            in_device: 0,
            queued: 0,
            completed: 10,
            skipped: 0,
            errors: 0,
            dq_blocked: 0,
            since_progress: Duration::ZERO,
            fault: None,
        }
    }

    fn verdict(health: &[StageHealth]) -> Verdict {
        assess(health, &TimingConfig::default())
    }

    #[test]
    fn test_idle_stage_is_healthy() {
        let mut stage = sample(PipeId::Flite);
        stage.since_progress = Duration::from_secs(10);
        assert_eq!(verdict(&[stage]), Verdict::Healthy);
    }

    #[test]
    fn test_busy_stage_without_progress_is_slow() {
        let mut stage = sample(PipeId::Isp);
        stage.in_device = 2;
        stage.since_progress = Duration::from_secs(1);
        assert_eq!(verdict(&[stage]), Verdict::Slow(vec!["ISP".to_string()]));
    }

    #[test]
    fn test_blocked_dequeues_fault() {
        let mut stage = sample(PipeId::Scp);
        stage.in_device = 1;
        stage.dq_blocked = 1000;
        assert!(matches!(verdict(&[stage]), Verdict::Fault { .. }));
    }

    #[test]
    fn test_device_fault_wins() {
        let mut faulted = sample(PipeId::ThreeAa);
        faulted.fault = Some("bus error".into());
        let mut slow = sample(PipeId::Isp);
        slow.in_device = 1;
        slow.since_progress = Duration::from_secs(1);
        match verdict(&[slow, faulted]) {
            Verdict::Fault { reason, .. } => assert_eq!(reason, "bus error"),
            other => panic!("unexpected verdict {:?}", other),
        }
    }
}
