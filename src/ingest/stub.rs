//! Synthetic frame source (`stub://`).
//!
//! Produces patterned frames from a producer thread at the configured rate.
//! Used for dry runs and tests that need a live source without a camera.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::retry::{poll_until, RetryPolicy, Sleeper, ThreadSleeper};
use super::{FrameSource, ProducerThreads};
use crate::error::ConnectError;
use crate::frame::{CaptureSession, Frame};

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct StubConfig {
    /// Descriptor, e.g. "stub://gate".
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Budget for the first frame to arrive in `start()`.
    pub startup: RetryPolicy,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            name: "stub://default".to_string(),
            width: 320,
            height: 240,
            fps: 10,
            startup: RetryPolicy::fixed(50, Duration::from_millis(20)),
        }
    }
}

/// Synthetic frame source.
pub struct StubSource {
    config: StubConfig,
    session: CaptureSession,
    threads: ProducerThreads,
    sleeper: Arc<dyn Sleeper>,
}

impl StubSource {
    pub fn new(config: StubConfig) -> Self {
        Self {
            config,
            session: CaptureSession::new(),
            threads: ProducerThreads::default(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }
}

/// Moving diagonal gradient; every frame differs from the previous one.
fn synthetic_frame(width: u32, height: u32, tick: u64) -> Frame {
    let image = image::RgbImage::from_fn(width, height, |x, y| {
        let base = (x as u64 + y as u64 + tick) % 200;
        image::Rgb([base as u8 + 20, (base / 2) as u8 + 40, 120])
    });
    Frame::new(image)
}

fn frame_interval(fps: u32) -> Duration {
    if fps == 0 {
        Duration::from_millis(100)
    } else {
        Duration::from_millis((1000 / fps).max(1) as u64)
    }
}

impl FrameSource for StubSource {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn start(&mut self) -> Result<(), ConnectError> {
        if self.session.is_running() {
            return Ok(());
        }
        self.release();
        self.session.reset();
        self.session.set_running(true);

        let session = self.session.clone();
        let (width, height) = (self.config.width.max(1), self.config.height.max(1));
        let interval = frame_interval(self.config.fps);
        let sleeper = self.sleeper.clone();
        self.threads
            .spawn("stub-frames", move || {
                let mut tick = 0u64;
                while session.is_running() {
                    let started = Instant::now();
                    session.publish(synthetic_frame(width, height, tick));
                    tick += 1;
                    sleeper.sleep(interval.saturating_sub(started.elapsed()));
                }
            })
            .map_err(|source| ConnectError::Spawn {
                program: self.config.name.clone(),
                source,
            })?;

        let session = self.session.clone();
        match poll_until(&self.config.startup, self.sleeper.as_ref(), || {
            session.state().frames_captured > 0
        }) {
            Ok(_) => {
                log::info!(
                    "StubSource: connected to {} ({}x{} @ {} fps)",
                    self.config.name,
                    width,
                    height,
                    self.config.fps
                );
                Ok(())
            }
            Err(attempts) => {
                self.release();
                Err(ConnectError::NoFrame {
                    source_name: self.config.name.clone(),
                    attempts,
                })
            }
        }
    }

    fn release(&mut self) {
        self.session.set_running(false);
        self.threads.join_all(Duration::from_secs(2));
    }

    fn session(&self) -> &CaptureSession {
        &self.session
    }
}

impl Drop for StubSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
