//! RTSP frame source backed by an `ffmpeg` subprocess.
//!
//! This module provides `FfmpegSource`, which keeps a continuously updated
//! current frame from a remote stream decoded by an external `ffmpeg` process.
//!
//! The source is responsible for:
//! - Launching the decoder with low-latency, TCP transport, no audio, raw RGB24
//!   output on stdout
//! - Draining stderr and tracking the negotiated resolution from it
//! - Reading fixed-size raw frames from stdout and publishing valid ones
//! - Terminating the decoder (SIGTERM, then kill after a grace period)
//!
//! The source MUST NOT:
//! - Block `read()` on the decoder
//! - Treat a stalled or ended stream as fatal once started

use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use regex::Regex;

use super::retry::{poll_until, RetryPolicy, Sleeper, ThreadSleeper};
use super::{FrameSource, ProducerThreads};
use crate::error::ConnectError;
use crate::frame::{CaptureSession, Frame};

const IDLE_DELAY: Duration = Duration::from_millis(100);

/// Configuration for an ffmpeg-decoded RTSP source.
#[derive(Clone, Debug)]
pub struct FfmpegConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Output frame width.
    pub width: u32,
    /// Output frame height.
    pub height: u32,
    /// Output frame rate requested from the decoder.
    pub fps: u32,
    /// Decoder binary.
    pub ffmpeg_path: String,
    /// Scale output to `width`x`height`. When false the output follows the
    /// stream's native resolution as reported on stderr.
    pub scale_output: bool,
    /// Budget for the first frame to arrive in `start()`.
    pub startup: RetryPolicy,
    /// How long the decoder gets to exit after SIGTERM.
    pub terminate_grace: Duration,
    /// How long `release()` waits for each producer thread.
    pub join_timeout: Duration,
    /// How long the frame reader waits for stderr to report the output size.
    pub resolution_grace: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            width: 1280,
            height: 720,
            fps: 25,
            ffmpeg_path: "ffmpeg".to_string(),
            scale_output: true,
            startup: RetryPolicy::startup(),
            terminate_grace: Duration::from_secs(5),
            join_timeout: Duration::from_secs(2),
            resolution_grace: Duration::from_secs(1),
        }
    }
}

/// Decoder command line for a config.
pub fn ffmpeg_args(config: &FfmpegConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "info",
        "-nostats",
        "-fflags",
        "nobuffer",
        "-flags",
        "low_delay",
        "-rtsp_transport",
        "tcp",
        "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(config.url.clone());
    args.push("-an".to_string());
    if config.scale_output {
        args.push("-vf".to_string());
        args.push(format!("scale={}:{}", config.width, config.height));
    }
    for arg in ["-pix_fmt", "rgb24", "-f", "rawvideo", "-r"] {
        args.push(arg.to_string());
    }
    args.push(config.fps.max(1).to_string());
    args.push("pipe:1".to_string());
    args
}

// ----------------------------------------------------------------------------
// Frame geometry shared between the stderr drain and the frame reader
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Geometry {
    width: u32,
    height: u32,
    output_reported: bool,
}

type SharedGeometry = Arc<Mutex<Geometry>>;

fn geometry(shared: &SharedGeometry) -> Geometry {
    *shared.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// stderr parsing
// ----------------------------------------------------------------------------

/// Resolution token found on a decoder diagnostic line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionReport {
    /// Native resolution of the incoming stream.
    Input(u32, u32),
    /// Resolution of the raw frames written to stdout.
    Output(u32, u32),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Section {
    #[default]
    Preamble,
    Input,
    Output,
}

/// Line-by-line parser for decoder stderr.
#[derive(Debug, Default)]
pub struct DiagnosticParser {
    section: Section,
}

fn resolution_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(\d{2,5})x(\d{2,5})\b").expect("resolution pattern is valid")
    })
}

impl DiagnosticParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> Option<ResolutionReport> {
        let trimmed = line.trim_start();
        if trimmed.starts_with("Input #") {
            self.section = Section::Input;
            return None;
        }
        if trimmed.starts_with("Output #") {
            self.section = Section::Output;
            return None;
        }
        if !line.contains("Video:") {
            return None;
        }
        let captures = resolution_pattern().captures(line)?;
        let width: u32 = captures.get(1)?.as_str().parse().ok()?;
        let height: u32 = captures.get(2)?.as_str().parse().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        match self.section {
            Section::Output => Some(ResolutionReport::Output(width, height)),
            Section::Input | Section::Preamble => Some(ResolutionReport::Input(width, height)),
        }
    }
}

fn drain_diagnostics<R: Read>(
    stderr: R,
    session: CaptureSession,
    shared: SharedGeometry,
    follow_input: bool,
) {
    let mut parser = DiagnosticParser::new();
    for line in BufReader::new(stderr).lines() {
        if !session.is_running() {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(err) if err.kind() == ErrorKind::InvalidData => continue,
            Err(_) => break,
        };

        match parser.feed(&line) {
            Some(ResolutionReport::Input(width, height)) => {
                log::info!("FfmpegSource: stream resolution {}x{}", width, height);
                session.set_detected_resolution(width, height);
                let mut geom = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if follow_input && !geom.output_reported {
                    geom.width = width;
                    geom.height = height;
                }
            }
            Some(ResolutionReport::Output(width, height)) => {
                let mut geom = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if (geom.width, geom.height) != (width, height) {
                    log::info!("FfmpegSource: output resolution now {}x{}", width, height);
                }
                geom.width = width;
                geom.height = height;
                geom.output_reported = true;
            }
            None => {}
        }

        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("failed") {
            log::warn!("FfmpegSource: ffmpeg: {}", line.trim());
        } else {
            log::trace!("FfmpegSource: ffmpeg: {}", line.trim());
        }
    }
}

// ----------------------------------------------------------------------------
// Raw frame reader
// ----------------------------------------------------------------------------

/// Result of one frame read from the raw stream.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A full, plausible frame.
    Frame(Frame),
    /// Short read after warm-up; the partial frame was discarded.
    Dropped,
    /// Short read during warm-up, even after asking for the remainder.
    Incomplete,
    /// Full frame rejected by the liveness heuristic.
    Invalid,
    /// Zero-length read.
    EndOfStream,
}

/// Reads fixed-size RGB24 frames from a byte stream.
///
/// Before the first valid frame (warm-up) a short read is topped up once;
/// after warm-up a short read drops the frame instead of waiting, so a damaged
/// frame never delays the ones behind it.
pub struct RawFrameReader<R> {
    reader: R,
    warmed_up: bool,
}

impl<R: Read> RawFrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            warmed_up: false,
        }
    }

    pub fn is_warmed_up(&self) -> bool {
        self.warmed_up
    }

    pub fn next_frame(&mut self, width: u32, height: u32) -> std::io::Result<ReadOutcome> {
        let expected = width as usize * height as usize * 3;
        if expected == 0 {
            return Ok(ReadOutcome::Invalid);
        }
        let mut pixels = vec![0u8; expected];
        let mut filled = fill(&mut self.reader, &mut pixels)?;
        if filled == 0 {
            return Ok(ReadOutcome::EndOfStream);
        }

        if filled < expected {
            if self.warmed_up {
                return Ok(ReadOutcome::Dropped);
            }
            filled += fill(&mut self.reader, &mut pixels[filled..])?;
            if filled < expected {
                return Ok(ReadOutcome::Incomplete);
            }
        }

        let Some(frame) = Frame::from_raw(width, height, pixels) else {
            return Ok(ReadOutcome::Invalid);
        };
        if frame.is_degenerate() {
            return Ok(ReadOutcome::Invalid);
        }
        self.warmed_up = true;
        Ok(ReadOutcome::Frame(frame))
    }
}

/// Read until `buf` is full or the stream reports end of data.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Frame reader loop. Runs until the session stops running.
fn pump_frames<R: Read>(
    reader: R,
    session: &CaptureSession,
    shared: &SharedGeometry,
    sleeper: &dyn Sleeper,
    idle_delay: Duration,
) {
    let mut frames = RawFrameReader::new(reader);
    while session.is_running() {
        let geom = geometry(shared);
        match frames.next_frame(geom.width, geom.height) {
            Ok(ReadOutcome::Frame(frame)) => {
                session.publish(frame);
                if session.state().frames_captured == 1 {
                    log::info!(
                        "FfmpegSource: first frame received ({}x{})",
                        geom.width,
                        geom.height
                    );
                }
            }
            Ok(ReadOutcome::Dropped) => {
                session.record_dropped();
                log::debug!("FfmpegSource: short read, frame dropped");
            }
            Ok(ReadOutcome::Incomplete) => sleeper.sleep(idle_delay),
            Ok(ReadOutcome::Invalid) => {
                session.record_rejected();
                if !frames.is_warmed_up() {
                    sleeper.sleep(idle_delay);
                }
            }
            Ok(ReadOutcome::EndOfStream) => sleeper.sleep(idle_delay),
            Err(err) => {
                if session.is_running() {
                    log::warn!("FfmpegSource: frame read failed: {}", err);
                }
                sleeper.sleep(idle_delay);
            }
        }
    }
}

fn wait_for_output_geometry(session: &CaptureSession, shared: &SharedGeometry, grace: Duration) {
    let deadline = Instant::now() + grace;
    while session.is_running() && !geometry(shared).output_reported && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
}

// ----------------------------------------------------------------------------
// FfmpegSource
// ----------------------------------------------------------------------------

/// RTSP source decoded by an external `ffmpeg` process.
pub struct FfmpegSource {
    config: FfmpegConfig,
    session: CaptureSession,
    geometry: SharedGeometry,
    child: Option<Child>,
    threads: ProducerThreads,
    sleeper: Arc<dyn Sleeper>,
}

impl FfmpegSource {
    pub fn new(config: FfmpegConfig) -> Self {
        let geometry = Arc::new(Mutex::new(Geometry {
            width: config.width,
            height: config.height,
            output_reported: false,
        }));
        Self {
            config,
            session: CaptureSession::new(),
            geometry,
            child: None,
            threads: ProducerThreads::default(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Current raw frame dimensions used for byte-length computation.
    pub fn frame_dimensions(&self) -> (u32, u32) {
        let geom = geometry(&self.geometry);
        (geom.width, geom.height)
    }

    fn spawn_producers(&mut self, mut child: Child) -> Result<(), ConnectError> {
        let spawn_error = |source: std::io::Error| ConnectError::Spawn {
            program: self.config.ffmpeg_path.clone(),
            source,
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.child = Some(child);
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            return Err(spawn_error(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "decoder pipes unavailable",
            )));
        };

        let session = self.session.clone();
        let shared = self.geometry.clone();
        let follow_input = !self.config.scale_output;
        self.threads
            .spawn("ffmpeg-stderr", move || {
                drain_diagnostics(stderr, session, shared, follow_input)
            })
            .map_err(spawn_error)?;

        let session = self.session.clone();
        let shared = self.geometry.clone();
        let sleeper = self.sleeper.clone();
        let grace = self.config.resolution_grace;
        self.threads
            .spawn("ffmpeg-frames", move || {
                wait_for_output_geometry(&session, &shared, grace);
                pump_frames(stdout, &session, &shared, sleeper.as_ref(), IDLE_DELAY);
            })
            .map_err(spawn_error)?;
        Ok(())
    }

    fn terminate_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        #[cfg(unix)]
        {
            // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
            let deadline = Instant::now() + self.config.terminate_grace;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                    Err(_) => break,
                }
            }
            log::warn!(
                "FfmpegSource: decoder ignored SIGTERM for {:?}, killing",
                self.config.terminate_grace
            );
        }

        if let Err(err) = child.kill() {
            log::warn!("FfmpegSource: failed to kill decoder: {}", err);
        }
        let _ = child.wait();
    }
}

impl FrameSource for FfmpegSource {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn start(&mut self) -> Result<(), ConnectError> {
        if self.session.is_running() {
            return Ok(());
        }
        self.release();
        self.session.reset();
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner) = Geometry {
            width: self.config.width,
            height: self.config.height,
            output_reported: false,
        };

        let child = Command::new(&self.config.ffmpeg_path)
            .args(ffmpeg_args(&self.config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ConnectError::Spawn {
                program: self.config.ffmpeg_path.clone(),
                source,
            })?;

        self.session.set_running(true);
        if let Err(err) = self.spawn_producers(child) {
            self.release();
            return Err(err);
        }

        log::info!("FfmpegSource: waiting for first frame");
        let session = self.session.clone();
        match poll_until(&self.config.startup, self.sleeper.as_ref(), || {
            session.state().frames_captured > 0
        }) {
            Ok(attempt) => {
                let (width, height) = self.frame_dimensions();
                log::info!(
                    "FfmpegSource: connected after {} poll(s) ({}x{})",
                    attempt,
                    width,
                    height
                );
                Ok(())
            }
            Err(attempts) => {
                self.release();
                Err(ConnectError::NoFrame {
                    source_name: "ffmpeg".to_string(),
                    attempts,
                })
            }
        }
    }

    fn release(&mut self) {
        let was_running = self.session.is_running();
        self.session.set_running(false);
        self.terminate_child();
        self.threads.join_all(self.config.join_timeout);
        if was_running {
            log::info!("FfmpegSource: released");
        }
    }

    fn session(&self) -> &CaptureSession {
        &self.session
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if self.child.is_some() || !self.threads.is_empty() {
            self.release();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
