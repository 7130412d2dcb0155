//! FFmpeg subprocess capture backend.
//!
//! FFmpeg decodes the source (RTSP over TCP, a V4L device or a file) and writes
//! raw BGR24 frames scaled to the configured size on stdout. A reader thread
//! slices stdout into frames and hands them over a bounded channel, so a
//! stalled source surfaces as a read timeout instead of a blocked caller.

use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::debug;

use crate::{
    backend::{CaptureBackend, SourceKind, parse_device_index},
    types::{CaptureError, CaptureSettings, Frame, FrameFormat},
};

/// Running ffmpeg process plus the thread draining its stdout.
struct Reader {
    child: Child,
    frames: Option<Receiver<Result<Frame, CaptureError>>>,
    thread: Option<JoinHandle<()>>,
}

impl Reader {
    fn spawn(mut cmd: Command, size: (i32, i32), queue_size: usize) -> Result<Self, CaptureError> {
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
        };

        let (tx, rx) = bounded(queue_size.max(1));
        let spawned = thread::Builder::new()
            .name("ffmpeg-reader".into())
            .spawn(move || read_loop(stdout, size, tx));
        match spawned {
            Ok(handle) => Ok(Self {
                child,
                frames: Some(rx),
                thread: Some(handle),
            }),
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(CaptureError::Other(err.into()))
            }
        }
    }

    fn next(&self, uri: &str, timeout: Duration) -> Result<Frame, CaptureError> {
        let frames = self.frames.as_ref().ok_or(CaptureError::NotOpen)?;
        match frames.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Read {
                uri: uri.to_string(),
                reason: format!("no frame within {timeout:?}"),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Read {
                uri: uri.to_string(),
                reason: "ffmpeg output closed".into(),
            }),
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        // Dropping the receiver fails any pending send; killing the child
        // closes stdout and ends a pending read.
        self.frames = None;
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn read_loop(mut stdout: ChildStdout, size: (i32, i32), tx: Sender<Result<Frame, CaptureError>>) {
    let frame_bytes = (size.0.max(0) as usize) * (size.1.max(0) as usize) * FrameFormat::Bgr8.channels();
    loop {
        let mut buffer = vec![0u8; frame_bytes];
        let item = match stdout.read_exact(&mut buffer) {
            Ok(()) => Ok(Frame {
                data: buffer,
                width: size.0,
                height: size.1,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            }),
            Err(err) => Err(CaptureError::Other(err.into())),
        };
        let failed = item.is_err();
        if tx.send(item).is_err() || failed {
            break;
        }
    }
}

pub struct FfmpegBackend {
    uri: String,
    reader: Option<Reader>,
    read_timeout: Duration,
    primed: Option<Frame>,
}

impl FfmpegBackend {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            reader: None,
            read_timeout: CaptureSettings::default().read_timeout,
            primed: None,
        }
    }

    fn build_command(&self, settings: &CaptureSettings) -> Command {
        let scale_arg = format!("scale={}:{}", settings.width, settings.height);
        let fps_arg = format!("{}", settings.fps);
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if settings.buffer_depth <= 1 {
            cmd.arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay");
        }

        match SourceKind::from_uri(&self.uri) {
            SourceKind::Rtsp => {
                // Socket I/O timeout in microseconds; ffmpeg exits instead of waiting forever.
                let timeout_us = settings.read_timeout.as_micros().max(1).to_string();
                cmd.arg("-rtsp_transport")
                    .arg("tcp")
                    .arg("-timeout")
                    .arg(&timeout_us)
                    .arg("-max_delay")
                    .arg("0")
                    .arg("-i")
                    .arg(&self.uri);
            }
            SourceKind::Device => match parse_device_index(&self.uri) {
                Some(index) => {
                    cmd.arg("-f")
                        .arg("video4linux2")
                        .arg("-framerate")
                        .arg(&fps_arg)
                        .arg("-video_size")
                        .arg(format!("{}x{}", settings.width, settings.height))
                        .arg("-i")
                        .arg(format!("/dev/video{index}"));
                }
                None => {
                    cmd.arg("-re").arg("-i").arg(&self.uri);
                }
            },
        }

        cmd.arg("-an")
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-r")
            .arg(&fps_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd
    }

    fn start(&mut self, cmd: Command, settings: &CaptureSettings) -> Result<(), CaptureError> {
        self.release();
        if settings.width <= 0 || settings.height <= 0 {
            return Err(CaptureError::Other(anyhow!(
                "capture size must be positive, got {}x{}",
                settings.width,
                settings.height
            )));
        }
        let reader = Reader::spawn(cmd, (settings.width, settings.height), settings.buffer_depth as usize)?;
        self.read_timeout = settings.read_timeout;

        // FFmpeg starts even when the source is unreachable; the first frame
        // tells us whether the stream is actually open.
        match reader.next(&self.uri, self.read_timeout) {
            Ok(frame) => {
                self.primed = Some(frame);
                self.reader = Some(reader);
                debug!(uri = %self.uri, "ffmpeg capture primed");
                Ok(())
            }
            Err(err) => {
                debug!(uri = %self.uri, error = %err, "ffmpeg produced no first frame");
                Err(CaptureError::Open {
                    uri: self.uri.clone(),
                })
            }
        }
    }
}

impl CaptureBackend for FfmpegBackend {
    fn open(&mut self, settings: &CaptureSettings) -> Result<(), CaptureError> {
        let cmd = self.build_command(settings);
        self.start(cmd, settings)
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.primed.take() {
            return Ok(frame);
        }
        let reader = self.reader.as_ref().ok_or(CaptureError::NotOpen)?;
        reader.next(&self.uri, self.read_timeout)
    }

    fn release(&mut self) {
        self.primed = None;
        self.reader = None;
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    fn settings(read_timeout: Duration) -> CaptureSettings {
        CaptureSettings {
            width: 4,
            height: 2,
            read_timeout,
            ..CaptureSettings::default()
        }
    }

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn stalled_source_times_out() {
        let mut backend = FfmpegBackend::new("rtsp://camera.invalid/stream");
        let started = Instant::now();
        let err = backend
            .start(shell("exec sleep 30"), &settings(Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, CaptureError::Open { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(backend.read(), Err(CaptureError::NotOpen)));
    }

    #[test]
    fn stall_after_first_frame_fails_the_read() {
        let mut backend = FfmpegBackend::new("rtsp://camera.invalid/stream");
        // One 4x2 BGR frame (24 bytes), then silence.
        backend
            .start(shell("head -c 24 /dev/zero; exec sleep 30"), &settings(Duration::from_millis(200)))
            .unwrap();

        let frame = backend.read().unwrap();
        assert_eq!((frame.width, frame.height, frame.data.len()), (4, 2, 24));

        let started = Instant::now();
        let err = backend.read().unwrap_err();
        assert!(matches!(err, CaptureError::Read { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        backend.release();
    }

    #[test]
    fn rtsp_command_carries_socket_timeout() {
        let backend = FfmpegBackend::new("rtsp://camera.local/stream");
        let cmd = backend.build_command(&settings(Duration::from_secs(3)));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        let at = args.iter().position(|a| a == "-timeout").unwrap();
        assert_eq!(args[at + 1], "3000000");
        assert!(at < args.iter().position(|a| a == "-i").unwrap());
    }
}
