// SPDX-License-Identifier: GPL-3.0-only

//! Camera capture pipeline engine
//!
//! This library moves frames from a sensor through a graph of processing
//! stages to the host: a live preview stream, an optional recording stream
//! and still captures taken from held raw frames.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Device, memory and host callback contracts, plus a simulated device
//! - [`buffers`]: Fixed-capacity buffer pools and the pool registry
//! - [`frame`]: Frames, per-stage entities and the frame arena
//! - [`pipes`]: Stage ids, frame queues and the per-stage worker
//! - [`factory`]: Graph topologies and the de-duplicated graph table
//! - [`selector`]: Hold lists and still-capture frame selection
//! - [`engine`]: The capture session and its workers
//! - [`config`]: Capture-mode descriptor
//!
//! # Example
//!
//! ```no_run
//! use camera_pipeline::backends::{HeapMemory, NullCallbacks, VirtualDevice};
//! use camera_pipeline::{CaptureConfig, CaptureSession};
//! use std::sync::Arc;
//!
//! let session = CaptureSession::new(
//!     Arc::new(VirtualDevice::new()),
//!     Arc::new(HeapMemory::new()),
//!     Arc::new(NullCallbacks),
//!     CaptureConfig::compact(),
//! )?;
//! session.start_preview()?;
//! let report = session.stop_preview()?;
//! assert!(report.is_clean());
//! # Ok::<(), camera_pipeline::PipelineError>(())
//! ```

pub mod backends;
pub mod buffers;
pub mod config;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod factory;
pub mod frame;
pub mod pipes;
pub mod selector;

// Re-export commonly used types
pub use buffers::{BufferPool, PoolRole};
pub use config::CaptureConfig;
pub use engine::{CaptureSession, SessionState, SessionStats, StopReport};
pub use errors::{HostErrorCode, PipelineError, Result};
pub use frame::{FrameArena, FrameId};
pub use pipes::PipeId;
pub use selector::CaptureIntent;
