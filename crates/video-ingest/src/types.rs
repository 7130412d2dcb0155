use std::time::Duration;

use anyhow::Error;
use thiserror::Error;

/// Raw BGR frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// All-black frame of the given size, used to warm up detectors.
    pub fn blank(width: i32, height: i32) -> Self {
        let len = (width.max(0) as usize) * (height.max(0) as usize) * FrameFormat::Bgr8.channels();
        Self {
            data: vec![0; len],
            width,
            height,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

/// Capture parameters applied after a source has been opened.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    /// Number of frames the backend may queue. 1 keeps latency minimal.
    pub buffer_depth: u32,
    /// Longest wait for a single frame before the read counts as failed.
    pub read_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30.0,
            buffer_depth: 1,
            read_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("no frame available from {uri:?}: {reason}")]
    Read { uri: String, reason: String },
    #[error("capture source is not open")]
    NotOpen,
    #[error(transparent)]
    Other(#[from] Error),
}
