//! Frame acquisition from network cameras and local devices.
//!
//! Backends implement [`CaptureBackend`]; [`SourceFeed`] layers the bounded
//! exponential-backoff reconnection state machine on top of any backend.

mod backend;
#[cfg(feature = "with-opencv")]
mod camera;
mod feed;
mod ffmpeg;
mod types;

pub use backend::{CaptureBackend, SourceKind, parse_device_index};
#[cfg(feature = "with-opencv")]
pub use camera::OpenCvBackend;
pub use feed::{
    FeedError, FeedState, FeedStats, ReconnectPolicy, SourceFeed, sleep_unless_shutdown,
};
pub use ffmpeg::FfmpegBackend;
pub use types::{CaptureError, CaptureSettings, Frame, FrameFormat};
