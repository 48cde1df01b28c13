// SPDX-License-Identifier: GPL-3.0-only
// Shared types for backend contracts

//! Shared types for stage and memory backends

use serde::{Deserialize, Serialize};

/// Image dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel layouts flowing between stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 12-bit packed bayer straight from the sensor
    Bayer12Packed,
    /// 16-bit unpacked bayer (after 3A processing)
    Bayer16,
    /// NV21 semi-planar YUV 4:2:0
    Nv21,
    /// YUYV packed 4:2:2
    Yuyv,
    /// Encoded JPEG bitstream
    Jpeg,
}

impl PixelFormat {
    /// Image plane sizes for a frame of this format (metadata plane excluded)
    pub fn plane_sizes(&self, size: Size) -> Vec<usize> {
        let pixels = size.pixels();
        match self {
            PixelFormat::Bayer12Packed => vec![pixels * 3 / 2],
            PixelFormat::Bayer16 => vec![pixels * 2],
            PixelFormat::Nv21 => vec![pixels, pixels / 2],
            PixelFormat::Yuyv => vec![pixels * 2],
            // Worst case bitstream, quality 100 never exceeds raw YUYV
            PixelFormat::Jpeg => vec![pixels * 2],
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Bayer12Packed => "SBGGR12P",
            PixelFormat::Bayer16 => "SBGGR16",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Jpeg => "JPEG",
        };
        write!(f, "{}", name)
    }
}

/// Format applied to a stage device at configure time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageFormat {
    pub format: PixelFormat,
    pub size: Size,
}

impl std::fmt::Display for StageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.format, self.size)
    }
}

/// Auto-focus state reported alongside each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AfState {
    #[default]
    Inactive,
    /// Lens still moving
    Scanning,
    Focused,
    NotFocused,
}

impl AfState {
    /// Frame is usable for a focus-wait capture
    pub fn is_settled(&self) -> bool {
        !matches!(self, AfState::Scanning)
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types for backend operations
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Device node could not be opened or configured
    OpenFailed(String),
    /// Queue, dequeue or streaming call failed
    Io(String),
    /// Hardware fault the stage cannot recover from (sensor timeout, DTP)
    Unrecoverable(String),
    /// Memory backend could not satisfy an allocation
    OutOfMemory(String),
    /// Handle does not refer to an open device or buffer
    InvalidHandle(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::OpenFailed(msg) => write!(f, "Open failed: {}", msg),
            BackendError::Io(msg) => write!(f, "I/O error: {}", msg),
            BackendError::Unrecoverable(msg) => write!(f, "Unrecoverable fault: {}", msg),
            BackendError::OutOfMemory(msg) => write!(f, "Out of memory: {}", msg),
            BackendError::InvalidHandle(msg) => write!(f, "Invalid handle: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nv21_plane_sizes() {
        let planes = PixelFormat::Nv21.plane_sizes(Size::new(64, 48));
        assert_eq!(planes, vec![3072, 1536]);
    }

    #[test]
    fn test_af_settled() {
        assert!(!AfState::Scanning.is_settled());
        assert!(AfState::Focused.is_settled());
    }
}
