// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture pipeline engine
//!
//! Transient errors (`NoBufferAvailable`, `SelectionTimeout`, `CaptureCancelled`)
//! are absorbed by the worker that hit them. Everything else propagates through
//! `start()`/`stop()` return values or the watchdog.

use crate::backends::BackendError;
use crate::frame::{EntityState, FrameId};
use crate::pipes::PipeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage device could not be opened, configured or streamed on
    #[error("stage {pipe} failed to initialize: {reason}")]
    StageInit { pipe: PipeId, reason: String },

    /// A stage device failed a queue/dequeue round trip
    #[error("stage {pipe} I/O error: {reason}")]
    StageIo { pipe: PipeId, reason: String },

    /// Backing memory could not be obtained for a pool
    #[error("allocation failed for pool {pool}: {reason}")]
    Allocation { pool: String, reason: String },

    /// No FREE buffer exists in the pool right now
    #[error("no buffer available in pool {pool}")]
    NoBufferAvailable { pool: String },

    /// Hold list produced no usable frame within the retry budget
    #[error("no frame selected from {pipe} after {attempts} attempts")]
    SelectionTimeout { pipe: PipeId, attempts: u32 },

    /// An expected frame is missing from a bookkeeping list
    #[error("frame list corruption in {list}: {frame} missing")]
    FrameListCorruption { list: String, frame: FrameId },

    /// Hardware reported a fault the session cannot survive
    #[error("unrecoverable device error on {pipe}: {reason}")]
    UnrecoverableDevice { pipe: PipeId, reason: String },

    /// Entity state machine rejected a transition
    #[error("invalid entity transition on {pipe}: {from:?} -> {to:?}")]
    InvalidTransition {
        pipe: PipeId,
        from: EntityState,
        to: EntityState,
    },

    /// Frame id refers to a slot that was already deleted or reused
    #[error("stale frame id {0}")]
    StaleFrame(FrameId),

    /// Frame has no entity for the requested pipe
    #[error("frame {frame} has no entity for {pipe}")]
    NoEntity { frame: FrameId, pipe: PipeId },

    #[error("buffer index {index} out of range for pool {pool}")]
    InvalidBufferIndex { pool: String, index: usize },

    /// Handle outlived its checkout; the slot was reset or handed out again
    #[error("stale handle for buffer {index} of pool {pool}")]
    StaleBuffer { pool: String, index: usize },

    /// Pool still has buffers checked out
    #[error("pool {pool} has {in_use} buffers in use")]
    PoolInUse { pool: String, in_use: usize },

    #[error("pool {0} is not allocated")]
    PoolNotAllocated(String),

    #[error("pool {0} is already allocated")]
    PoolAlreadyAllocated(String),

    /// Session state machine rejected an operation
    #[error("operation {operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("pipe {0} is not part of this graph")]
    PipeNotInGraph(PipeId),

    /// Still capture was cancelled while waiting for a frame
    #[error("capture cancelled")]
    CaptureCancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl PipelineError {
    /// Errors a worker retries or skips past instead of propagating
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoBufferAvailable { .. } | Self::SelectionTimeout { .. } | Self::CaptureCancelled
        )
    }

    /// Code delivered to the host `on_error` callback
    pub fn error_code(&self) -> HostErrorCode {
        match self {
            Self::StageInit { .. } | Self::Allocation { .. } => HostErrorCode::StartFailed,
            Self::UnrecoverableDevice { .. } => HostErrorCode::DeviceFault,
            Self::SelectionTimeout { .. } | Self::CaptureCancelled => HostErrorCode::CaptureFailed,
            Self::StageIo { .. } => HostErrorCode::StageIo,
            _ => HostErrorCode::Internal,
        }
    }

    /// Attach the failing pipe to a backend error
    pub fn from_backend(pipe: PipeId, err: BackendError) -> Self {
        match err {
            BackendError::Unrecoverable(reason) => Self::UnrecoverableDevice { pipe, reason },
            BackendError::OpenFailed(reason) => Self::StageInit { pipe, reason },
            BackendError::OutOfMemory(reason) => Self::Allocation {
                pool: pipe.to_string(),
                reason,
            },
            other => Self::StageIo {
                pipe,
                reason: other.to_string(),
            },
        }
    }
}

/// Error codes surfaced through `HostCallbacks::on_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostErrorCode {
    /// Session could not start
    StartFailed,
    /// A stage stopped responding or reported a hardware fault
    DeviceFault,
    /// Every shot of a capture sequence was skipped
    CaptureFailed,
    StageIo,
    Internal,
}

impl std::fmt::Display for HostErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StartFailed => "start-failed",
            Self::DeviceFault => "device-fault",
            Self::CaptureFailed => "capture-failed",
            Self::StageIo => "stage-io",
            Self::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = PipelineError::NoBufferAvailable {
            pool: "scaler".into(),
        };
        assert!(err.is_transient());

        let err = PipelineError::StageInit {
            pipe: PipeId::Flite,
            reason: "open failed".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.error_code(), HostErrorCode::StartFailed);
    }

    #[test]
    fn test_backend_error_mapping() {
        let err = PipelineError::from_backend(
            PipeId::ThreeAa,
            BackendError::Unrecoverable("sensor timeout".into()),
        );
        assert!(matches!(err, PipelineError::UnrecoverableDevice { .. }));
        assert_eq!(err.error_code(), HostErrorCode::DeviceFault);

        let err = PipelineError::from_backend(PipeId::Isp, BackendError::Io("dqbuf".into()));
        assert!(matches!(err, PipelineError::StageIo { pipe: PipeId::Isp, .. }));
    }

    #[test]
    fn test_display_mentions_pipe() {
        let err = PipelineError::SelectionTimeout {
            pipe: PipeId::Flite,
            attempts: 3,
        };
        assert!(err.to_string().contains("FLITE"));
    }
}
