//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for capturing frames from local V4L2
//! devices (e.g., /dev/video0).
//!
//! The V4L2 source is responsible for:
//! - Negotiating RGB24 (or MJPEG, decoded in-memory) at the configured size
//! - Capturing from a memory-mapped stream on a producer thread
//! - Publishing plausible frames into the session slot
//!
//! The device is opened on the producer thread and never leaves it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::retry::{poll_until, RetryPolicy, Sleeper, ThreadSleeper};
use super::{FrameSource, ProducerThreads};
use crate::error::ConnectError;
use crate::frame::{CaptureSession, Frame};

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Requested frame rate.
    pub fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
    /// Budget for the first frame to arrive in `start()`.
    pub startup: RetryPolicy,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            fps: 10,
            width: 640,
            height: 480,
            startup: RetryPolicy::startup(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelLayout {
    Rgb24,
    Mjpeg,
}

#[self_referencing]
struct DeviceStream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

struct OpenDevice {
    stream: DeviceStream,
    layout: PixelLayout,
    width: u32,
    height: u32,
}

fn open_device(config: &V4l2Config) -> Result<OpenDevice> {
    use v4l::buffer::Type;
    use v4l::video::Capture;

    let mut device = v4l::Device::with_path(&config.device)
        .with_context(|| format!("open v4l2 device {}", config.device))?;
    let mut format = device.format().context("read v4l2 format")?;
    format.width = config.width;
    format.height = config.height;
    format.fourcc = v4l::FourCC::new(b"RGB3");

    let format = match device.set_format(&format) {
        Ok(format) => format,
        Err(err) => {
            log::warn!(
                "V4l2Source: failed to set RGB3 on {}: {}",
                config.device,
                err
            );
            device
                .format()
                .context("read v4l2 format after set failure")?
        }
    };
    let layout = match &format.fourcc.repr {
        b"RGB3" => PixelLayout::Rgb24,
        b"MJPG" => PixelLayout::Mjpeg,
        other => {
            return Err(anyhow!(
                "unsupported v4l2 pixel format {}",
                String::from_utf8_lossy(other)
            ))
        }
    };

    if config.fps > 0 {
        let params = v4l::video::capture::Parameters::with_fps(config.fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!("V4l2Source: failed to set fps on {}: {}", config.device, err);
        }
    }

    let stream = DeviceStream::try_new(device, |device| {
        v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
            .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
    })?;

    Ok(OpenDevice {
        stream,
        layout,
        width: format.width,
        height: format.height,
    })
}

fn decode_buffer(layout: PixelLayout, width: u32, height: u32, buf: &[u8]) -> Option<Frame> {
    match layout {
        PixelLayout::Rgb24 => {
            let expected = width as usize * height as usize * 3;
            if buf.len() < expected {
                return None;
            }
            Frame::from_raw(width, height, buf[..expected].to_vec())
        }
        PixelLayout::Mjpeg => image::load_from_memory(buf)
            .ok()
            .map(|image| Frame::new(image.into_rgb8())),
    }
}

fn capture_loop(config: V4l2Config, session: CaptureSession) {
    use v4l::io::traits::CaptureStream;

    let mut open = match open_device(&config) {
        Ok(open) => open,
        Err(err) => {
            log::error!("V4l2Source: {:#}", err);
            session.set_running(false);
            return;
        }
    };
    log::info!(
        "V4l2Source: connected to {} ({}x{})",
        config.device,
        open.width,
        open.height
    );
    session.set_detected_resolution(open.width, open.height);

    let (layout, width, height) = (open.layout, open.width, open.height);
    while session.is_running() {
        let frame = open.stream.with_mut(|fields| match fields.stream.next() {
            Ok((buf, _meta)) => Ok(decode_buffer(layout, width, height, buf)),
            Err(err) => Err(err),
        });
        match frame {
            Ok(Some(frame)) if !frame.is_degenerate() => {
                session.publish(frame);
            }
            Ok(Some(_)) => session.record_rejected(),
            Ok(None) => session.record_dropped(),
            Err(err) => {
                log::warn!("V4l2Source: capture failed on {}: {}", config.device, err);
                session.record_dropped();
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Local capture device source.
pub struct V4l2Source {
    config: V4l2Config,
    session: CaptureSession,
    threads: ProducerThreads,
    sleeper: Arc<dyn Sleeper>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            config,
            session: CaptureSession::new(),
            threads: ProducerThreads::default(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn start(&mut self) -> Result<(), ConnectError> {
        if self.session.is_running() {
            return Ok(());
        }
        self.release();
        self.session.reset();
        self.session.set_running(true);

        let config = self.config.clone();
        let session = self.session.clone();
        self.threads
            .spawn("v4l2-capture", move || capture_loop(config, session))
            .map_err(|source| ConnectError::Spawn {
                program: self.config.device.clone(),
                source,
            })?;

        let session = self.session.clone();
        match poll_until(&self.config.startup, self.sleeper.as_ref(), || {
            session.state().frames_captured > 0 || !session.is_running()
        }) {
            Ok(_) if self.session.state().frames_captured > 0 => Ok(()),
            Ok(attempt) | Err(attempt) => {
                self.release();
                Err(ConnectError::NoFrame {
                    source_name: self.config.device.clone(),
                    attempts: attempt,
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

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_buffers_are_trimmed_to_frame_size() {
        let mut buf = vec![90u8; 4 * 2 * 3];
        buf.extend([0u8; 16]);
        let frame = decode_buffer(PixelLayout::Rgb24, 4, 2, &buf).expect("frame");
        assert_eq!((frame.width(), frame.height()), (4, 2));
        assert!(decode_buffer(PixelLayout::Rgb24, 4, 2, &buf[..10]).is_none());
    }

    #[test]
    fn missing_device_fails_start() {
        let mut source = V4l2Source::new(V4l2Config {
            device: "/dev/video-plate-watch-missing".into(),
            startup: RetryPolicy::fixed(20, Duration::from_millis(10)),
            ..V4l2Config::default()
        });
        assert!(matches!(
            source.start(),
            Err(ConnectError::NoFrame { .. })
        ));
    }
}
