//! Capture backend abstraction shared by the FFmpeg and OpenCV sources.

use crate::types::{CaptureError, CaptureSettings, Frame};

/// A frame source that can be opened, read synchronously and released.
///
/// Implementations own whatever handle the underlying transport needs (a
/// child process, a `VideoCapture`, ...). `release` must be idempotent.
pub trait CaptureBackend: Send {
    /// Open the source and apply resolution, frame rate and buffer depth.
    fn open(&mut self, settings: &CaptureSettings) -> Result<(), CaptureError>;

    /// Block until the next frame is available.
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Tear down the underlying handle.
    fn release(&mut self);

    /// Human readable source identifier used in logs.
    fn describe(&self) -> String;
}

impl<B: CaptureBackend + ?Sized> CaptureBackend for Box<B> {
    fn open(&mut self, settings: &CaptureSettings) -> Result<(), CaptureError> {
        (**self).open(settings)
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport used to source frames.
pub enum SourceKind {
    /// Local V4L devices or pre-recorded files.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else {
            SourceKind::Device
        }
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_index_accepts_bare_numbers_and_dev_paths() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam.local/stream"), None);
    }

    #[test]
    fn source_kind_detects_rtsp() {
        assert_eq!(SourceKind::from_uri("rtsp://10.0.0.4/live"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_uri("rtsps://10.0.0.4/live"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_uri("0"), SourceKind::Device);
        assert_eq!(SourceKind::from_uri("/tmp/clip.mp4"), SourceKind::Device);
    }
}
