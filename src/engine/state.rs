// SPDX-License-Identifier: GPL-3.0-only

//! Session state machine
//!
//! ```text
//! Idle ─▶ PreviewStarting ─▶ PreviewRunning ⇄ RecordingRunning
//!  ▲            │                 │  ▲   ⇅           │
//!  │            ▼                 ▼  │ CaptureInProgress
//!  └──── PreviewStopping ◀────────┴──┴── Restarting ──┘
//!                 ▲
//!              Faulted
//! ```
//!
//! `Faulted` is entered by the watchdog; only a stop leaves it. A restart
//! from `RecordingRunning` comes back to `RecordingRunning`.

use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    PreviewStarting,
    PreviewRunning,
    RecordingRunning,
    CaptureInProgress,
    PreviewStopping,
    /// Graphs torn down and rebuilt without leaving the session
    Restarting,
    /// A stage failed beyond recovery
    Faulted,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::PreviewStarting => "preview-starting",
            SessionState::PreviewRunning => "preview-running",
            SessionState::RecordingRunning => "recording-running",
            SessionState::CaptureInProgress => "capture-in-progress",
            SessionState::PreviewStopping => "preview-stopping",
            SessionState::Restarting => "restarting",
            SessionState::Faulted => "faulted",
        }
    }

    /// Preview graph is streaming
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            SessionState::PreviewRunning | SessionState::RecordingRunning | SessionState::CaptureInProgress
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (_, Faulted) => !matches!(self, Idle | PreviewStopping | Faulted),
            (Idle, PreviewStarting) => true,
            (PreviewStarting, PreviewRunning) | (PreviewStarting, PreviewStopping) => true,
            (PreviewRunning, RecordingRunning)
            | (PreviewRunning, CaptureInProgress)
            | (PreviewRunning, Restarting)
            | (PreviewRunning, PreviewStopping) => true,
            (RecordingRunning, PreviewRunning)
            | (RecordingRunning, CaptureInProgress)
            | (RecordingRunning, Restarting)
            | (RecordingRunning, PreviewStopping) => true,
            (CaptureInProgress, PreviewRunning)
            | (CaptureInProgress, RecordingRunning)
            | (CaptureInProgress, PreviewStopping) => true,
            (Restarting, PreviewRunning)
            | (Restarting, RecordingRunning)
            | (Restarting, PreviewStopping) => true,
            (Faulted, PreviewStopping) => true,
            (PreviewStopping, Idle) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Current state plus whether recording continues underneath a capture
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
    recording: bool,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            recording: false,
        }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Move to `next` or fail with `InvalidState` naming `operation`
    pub fn transition(&mut self, next: SessionState, operation: &'static str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, operation, "Session state change");
        match next {
            SessionState::RecordingRunning => self.recording = true,
            SessionState::PreviewRunning if self.state != SessionState::CaptureInProgress => {
                self.recording = false
            }
            SessionState::Idle => self.recording = false,
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Recording toggled while a capture is in progress
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    /// State a finished restart returns to
    pub fn after_restart(&self) -> SessionState {
        self.after_capture()
    }

    /// State a finished capture returns to
    pub fn after_capture(&self) -> SessionState {
        if self.recording {
            SessionState::RecordingRunning
        } else {
            SessionState::PreviewRunning
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_lifecycle() {
        let mut machine = SessionStateMachine::default();
        machine.transition(SessionState::PreviewStarting, "start").unwrap();
        machine.transition(SessionState::PreviewRunning, "start").unwrap();
        machine.transition(SessionState::PreviewStopping, "stop").unwrap();
        machine.transition(SessionState::Idle, "stop").unwrap();
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn test_capture_returns_to_recording() {
        let mut machine = SessionStateMachine::default();
        machine.transition(SessionState::PreviewStarting, "start").unwrap();
        machine.transition(SessionState::PreviewRunning, "start").unwrap();
        machine.transition(SessionState::RecordingRunning, "record").unwrap();
        machine.transition(SessionState::CaptureInProgress, "capture").unwrap();
        assert_eq!(machine.after_capture(), SessionState::RecordingRunning);
        machine.transition(machine.after_capture(), "capture").unwrap();
        assert!(machine.is_recording());
    }

    #[test]
    fn test_restart_keeps_recording() {
        let mut machine = SessionStateMachine::default();
        machine.transition(SessionState::PreviewStarting, "start").unwrap();
        machine.transition(SessionState::PreviewRunning, "start").unwrap();
        machine.transition(SessionState::RecordingRunning, "record").unwrap();
        machine.transition(SessionState::Restarting, "restart_preview").unwrap();
        assert!(machine.is_recording());
        assert_eq!(machine.after_restart(), SessionState::RecordingRunning);
        machine.transition(machine.after_restart(), "restart_preview").unwrap();
        assert!(machine.is_recording());

        // Dropping recording across the restart lands in plain preview
        machine.transition(SessionState::Restarting, "restart_preview").unwrap();
        machine.set_recording(false);
        assert_eq!(machine.after_restart(), SessionState::PreviewRunning);
        machine.transition(machine.after_restart(), "restart_preview").unwrap();
        assert!(!machine.is_recording());
        assert!(!SessionState::CaptureInProgress.can_transition_to(SessionState::Restarting));
    }

    #[test]
    fn test_invalid_transition_names_operation() {
        let mut machine = SessionStateMachine::default();
        let err = machine
            .transition(SessionState::CaptureInProgress, "take_picture")
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidState { operation: "take_picture", .. }
        ));
    }

    #[test]
    fn test_faulted_only_accepts_stop() {
        let mut machine = SessionStateMachine::default();
        machine.transition(SessionState::PreviewStarting, "start").unwrap();
        machine.transition(SessionState::PreviewRunning, "start").unwrap();
        machine.transition(SessionState::Faulted, "watchdog").unwrap();
        assert!(!SessionState::Faulted.can_transition_to(SessionState::PreviewRunning));
        assert!(!SessionState::Faulted.can_transition_to(SessionState::CaptureInProgress));
        machine.transition(SessionState::PreviewStopping, "stop").unwrap();
    }
}
