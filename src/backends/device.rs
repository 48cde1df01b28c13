// SPDX-License-Identifier: GPL-3.0-only

//! Stage device contract
//!
//! Mirrors V4L2 node semantics: a stage is opened once, configured with a
//! format, streamed on, then fed with buffer indices that come back from
//! `dequeue` in submission order.

use super::types::{AfState, BackendResult, StageFormat};
use crate::pipes::PipeId;
use std::time::Duration;

/// Opaque handle to an opened stage device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Completion status of a dequeued buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Buffer queued, not yet processed
    Pending,
    /// Stage wrote valid data
    Done,
    /// Stage reported a per-frame failure
    Error,
}

/// Buffer descriptor exchanged with a stage device
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    /// Pool index of the buffer the stage writes (or reads, for sinks)
    pub index: Option<usize>,
    /// Frame count the buffer belongs to
    pub fcount: u32,
    pub status: DeviceStatus,
    /// Sensor timestamp, filled at dequeue
    pub timestamp_ns: u64,
    /// Faces found (face-detection stages only)
    pub faces: u32,
    pub af: AfState,
}

impl DeviceBuffer {
    pub fn new(index: Option<usize>, fcount: u32) -> Self {
        Self {
            index,
            fcount,
            status: DeviceStatus::Pending,
            timestamp_ns: 0,
            faces: 0,
            af: AfState::Inactive,
        }
    }
}

/// Hardware stage backend
///
/// Implementations must be callable from any worker thread. `dequeue` is the
/// only call allowed to block, and only up to `timeout`.
pub trait DeviceBackend: Send + Sync {
    // ===== Lifecycle =====

    /// Open the device node backing a pipe
    fn open(&self, pipe: PipeId) -> BackendResult<DeviceHandle>;

    /// Apply the stage format
    fn configure(&self, handle: DeviceHandle, format: &StageFormat) -> BackendResult<()>;

    /// Release the device node
    fn close(&self, handle: DeviceHandle) -> BackendResult<()>;

    // ===== Streaming =====

    fn stream_on(&self, handle: DeviceHandle) -> BackendResult<()>;

    /// Stop streaming; buffers still queued are flushed without completion
    fn stream_off(&self, handle: DeviceHandle) -> BackendResult<()>;

    // ===== Buffers =====

    fn enqueue(&self, handle: DeviceHandle, buffer: DeviceBuffer) -> BackendResult<()>;

    /// Wait up to `timeout` for the oldest queued buffer
    ///
    /// `Ok(None)` means nothing completed in time, which is not an error.
    fn dequeue(&self, handle: DeviceHandle, timeout: Duration)
    -> BackendResult<Option<DeviceBuffer>>;
}
