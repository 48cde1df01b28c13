// SPDX-License-Identifier: GPL-3.0-only

//! Collaborator contracts consumed by the pipeline engine
//!
//! The engine never talks to hardware or allocators directly. Everything
//! below this layer is reached through three traits:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              CaptureSession                  │
//! └──────┬──────────────┬──────────────┬────────┘
//!        │              │              │
//! ┌──────┴──────┐ ┌─────┴──────┐ ┌─────┴───────┐
//! │DeviceBackend│ │MemoryBackend│ │HostCallbacks│
//! │ (per stage) │ │ (planes)    │ │ (host app)  │
//! └──────┬──────┘ └─────┬──────┘ └─────────────┘
//!        │              │
//! ┌──────┴──────┐ ┌─────┴──────┐
//! │VirtualDevice│ │ HeapMemory │  ← simulated implementations
//! └─────────────┘ └────────────┘
//! ```
//!
//! # Modules
//!
//! - [`device`]: stage device contract with V4L2-like queue semantics
//! - [`memory`]: native buffer allocation
//! - [`callbacks`]: fire-and-forget notifications to the host
//! - [`virtual_device`]: simulated stage devices with fault injection

pub mod callbacks;
pub mod device;
pub mod memory;
pub mod types;
pub mod virtual_device;

pub use callbacks::{CallbackBuffer, CallbackEvent, ChannelCallbacks, HostCallbacks, NullCallbacks};
pub use device::{DeviceBackend, DeviceBuffer, DeviceHandle, DeviceStatus};
pub use memory::{AllocFlags, HeapMemory, MemoryBackend, NativeBuffer};
pub use types::*;
pub use virtual_device::VirtualDevice;
