//! Self-healing frame feed.
//!
//! `SourceFeed` wraps a [`CaptureBackend`] with the connection state machine:
//!
//! ```text
//! Disconnected -> Connected -> (read failure) -> Disconnected -> (reconnect) -> Connected | Exhausted
//! ```
//!
//! Reconnection waits `min(base * 2^(n-1), 60s)` before attempt `n` and gives
//! up permanently once `max_retries` attempts have been spent without a
//! successful connect.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    backend::CaptureBackend,
    types::{CaptureError, CaptureSettings, Frame},
};

/// Granularity used when sleeping so shutdown is observed promptly.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl ReconnectPolicy {
    pub const MAX_DELAY: Duration = Duration::from_secs(60);

    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay: Self::MAX_DELAY,
            max_retries,
        }
    }

    /// Delay applied before reconnection attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connected,
    /// Retry budget spent. Terminal for this feed instance.
    Exhausted,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection to {source_uri} failed: {cause}")]
    ConnectionFailed {
        source_uri: String,
        #[source]
        cause: CaptureError,
    },
    #[error("no frame: {0}")]
    NoFrame(#[source] CaptureError),
    #[error("reconnection attempts exhausted after {attempts} tries")]
    Exhausted { attempts: u32 },
    #[error("shutdown requested")]
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct FeedStats {
    pub source: String,
    pub connected: bool,
    pub frames_captured: u64,
    pub retry_count: u32,
}

pub struct SourceFeed<B: CaptureBackend> {
    backend: B,
    settings: CaptureSettings,
    policy: ReconnectPolicy,
    state: FeedState,
    retry_count: u32,
    frame_count: u64,
    shutdown: Arc<AtomicBool>,
}

impl<B: CaptureBackend> SourceFeed<B> {
    pub fn new(
        backend: B,
        settings: CaptureSettings,
        policy: ReconnectPolicy,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            backend,
            settings,
            policy,
            state: FeedState::Disconnected,
            retry_count: 0,
            frame_count: 0,
            shutdown,
        }
    }

    /// Open the source. Resets the retry budget on success.
    pub fn connect(&mut self) -> Result<(), FeedError> {
        if self.state == FeedState::Exhausted {
            return Err(FeedError::Exhausted {
                attempts: self.retry_count,
            });
        }

        let source = self.backend.describe();
        info!(source = %source, "Connecting to camera source");
        match self.backend.open(&self.settings) {
            Ok(()) => {
                self.state = FeedState::Connected;
                self.retry_count = 0;
                info!(
                    source = %source,
                    width = self.settings.width,
                    height = self.settings.height,
                    fps = self.settings.fps,
                    "Camera connection established"
                );
                Ok(())
            }
            Err(cause) => {
                error!(source = %source, "Camera connection error: {cause}");
                self.state = FeedState::Disconnected;
                Err(FeedError::ConnectionFailed {
                    source_uri: source,
                    cause,
                })
            }
        }
    }

    /// Read the next frame, reconnecting first when the link is down.
    ///
    /// A failed read on a live connection marks it broken so the next call
    /// goes through the reconnect path.
    pub fn read_frame(&mut self) -> Result<Frame, FeedError> {
        if self.state != FeedState::Connected {
            self.reconnect()?;
        }

        match self.backend.read() {
            Ok(frame) => {
                self.frame_count += 1;
                metrics::counter!("feed_frames_captured_total").increment(1);
                Ok(frame)
            }
            Err(err) => {
                warn!("Failed to read frame from camera: {err}");
                self.state = FeedState::Disconnected;
                Err(FeedError::NoFrame(err))
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), FeedError> {
        if self.state == FeedState::Exhausted || self.retry_count >= self.policy.max_retries {
            if self.state != FeedState::Exhausted {
                error!(
                    max_retries = self.policy.max_retries,
                    "Max reconnection attempts exceeded; feed requires a restart"
                );
                self.state = FeedState::Exhausted;
            }
            return Err(FeedError::Exhausted {
                attempts: self.retry_count,
            });
        }

        self.retry_count += 1;
        let delay = self.policy.delay_for(self.retry_count);
        info!(
            attempt = self.retry_count,
            max_retries = self.policy.max_retries,
            delay_secs = delay.as_secs_f64(),
            "Reconnection attempt scheduled"
        );
        metrics::counter!("feed_reconnect_attempts_total").increment(1);

        if !sleep_unless_shutdown(delay, &self.shutdown) {
            return Err(FeedError::Shutdown);
        }
        self.release();
        self.connect()
    }

    /// Tear down the capture handle. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.backend.release();
        if self.state != FeedState::Exhausted {
            self.state = FeedState::Disconnected;
        }
        debug!("Camera resource released");
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == FeedState::Connected
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            source: self.backend.describe(),
            connected: self.is_connected(),
            frames_captured: self.frame_count,
            retry_count: self.retry_count,
        }
    }
}

/// Sleep for `duration` in short slices. Returns `false` if shutdown was
/// requested before the full duration elapsed.
pub fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SHUTDOWN_POLL));
    }
}
