// SPDX-License-Identifier: GPL-3.0-only

//! Host notification surface
//!
//! Callbacks run on pipeline worker threads. Implementations must return
//! quickly; anything slow belongs on the host's own thread.

use super::memory::NativeBuffer;
use crate::errors::HostErrorCode;
use crossbeam_channel::{Receiver, Sender, unbounded};

/// Read-only view of a buffer handed to the host
///
/// The buffer goes back to its pool as soon as the callback returns.
#[derive(Debug, Clone)]
pub struct CallbackBuffer {
    pub fcount: u32,
    pub pool: String,
    pub index: usize,
    pub planes: Vec<NativeBuffer>,
    pub timestamp_ns: u64,
}

impl CallbackBuffer {
    /// Total bytes across all planes
    pub fn len(&self) -> usize {
        self.planes.iter().map(|p| p.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Callbacks fired by the engine
pub trait HostCallbacks: Send + Sync {
    fn on_shutter(&self) {}

    fn on_frame_metadata(&self, _fcount: u32, _faces: u32) {}

    fn on_preview_frame(&self, _buffer: &CallbackBuffer) {}

    fn on_video_frame(&self, _buffer: &CallbackBuffer, _timestamp_ns: u64) {}

    fn on_picture_done(&self, _picture: &CallbackBuffer) {}

    fn on_error(&self, _code: HostErrorCode) {}
}

/// Callbacks that drop every notification
pub struct NullCallbacks;

impl HostCallbacks for NullCallbacks {}

/// Notification forwarded by [`ChannelCallbacks`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Shutter,
    Metadata { fcount: u32, faces: u32 },
    Preview { fcount: u32, index: usize },
    Video { fcount: u32, timestamp_ns: u64 },
    Picture { fcount: u32, bytes: usize },
    Error(HostErrorCode),
}

/// Callbacks that forward every notification over a channel
///
/// Sending never blocks, so the pipeline thread returns immediately.
pub struct ChannelCallbacks {
    tx: Sender<CallbackEvent>,
}

impl ChannelCallbacks {
    pub fn new() -> (Self, Receiver<CallbackEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: CallbackEvent) {
        // Receiver gone means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl HostCallbacks for ChannelCallbacks {
    fn on_shutter(&self) {
        self.send(CallbackEvent::Shutter);
    }

    fn on_frame_metadata(&self, fcount: u32, faces: u32) {
        self.send(CallbackEvent::Metadata { fcount, faces });
    }

    fn on_preview_frame(&self, buffer: &CallbackBuffer) {
        self.send(CallbackEvent::Preview {
            fcount: buffer.fcount,
            index: buffer.index,
        });
    }

    fn on_video_frame(&self, buffer: &CallbackBuffer, timestamp_ns: u64) {
        self.send(CallbackEvent::Video {
            fcount: buffer.fcount,
            timestamp_ns,
        });
    }

    fn on_picture_done(&self, picture: &CallbackBuffer) {
        self.send(CallbackEvent::Picture {
            fcount: picture.fcount,
            bytes: picture.len(),
        });
    }

    fn on_error(&self, code: HostErrorCode) {
        self.send(CallbackEvent::Error(code));
    }
}
