//! OpenCV-backed camera capture.

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{info, warn};

use crate::{
    backend::{CaptureBackend, parse_device_index},
    types::{CaptureError, CaptureSettings, Frame, FrameFormat},
};

pub struct OpenCvBackend {
    uri: String,
    cap: Option<VideoCapture>,
    target_size: (i32, i32),
    frame: Mat,
    scratch: Mat,
}

impl OpenCvBackend {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            cap: None,
            target_size: (0, 0),
            frame: Mat::default(),
            scratch: Mat::default(),
        }
    }

    fn read_error(&self, reason: impl ToString) -> CaptureError {
        CaptureError::Read {
            uri: self.uri.clone(),
            reason: reason.to_string(),
        }
    }
}

impl CaptureBackend for OpenCvBackend {
    fn open(&mut self, settings: &CaptureSettings) -> Result<(), CaptureError> {
        self.release();
        let mut cap = open_video_capture(&self.uri)?;
        configure_camera(&mut cap, settings);

        let actual_w = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or_default();
        let actual_h = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or_default();
        let actual_fps = cap.get(videoio::CAP_PROP_FPS).unwrap_or_default();
        info!(
            "Resolution: {}x{} @ {}fps",
            actual_w as i32, actual_h as i32, actual_fps as i32
        );

        self.target_size = (settings.width, settings.height);
        self.cap = Some(cap);
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        let cap = self.cap.as_mut().ok_or(CaptureError::NotOpen)?;
        let grabbed = cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Err(self.read_error("capture returned no frame"));
        }

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 {
            return Err(self.read_error("capture returned an empty frame"));
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn release(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            let _ = cap.release();
        }
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

impl Drop for OpenCvBackend {
    fn drop(&mut self) {
        self.release();
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    let backend = if uri.starts_with("rtsp") {
        videoio::CAP_FFMPEG
    } else {
        videoio::CAP_ANY
    };
    match VideoCapture::from_file(uri, backend) {
        Ok(cap) => {
            if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                return Ok(cap);
            }
        }
        Err(err) => {
            warn!("failed to open {uri} with backend {backend}: {err}");
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply resolution, frame rate, buffer depth and read timeout. Unsupported properties are ignored.
fn configure_camera(cap: &mut VideoCapture, settings: &CaptureSettings) {
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, settings.width as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, settings.height as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, settings.fps);
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, settings.buffer_depth as f64);
    let _ = cap.set(videoio::CAP_PROP_READ_TIMEOUT_MSEC, settings.read_timeout.as_millis() as f64);
}
