//! Acquisition/detection session controller.
//!
//! A `Session` owns one frame source, the detection orchestrator and the
//! sinks. It is responsible for:
//! - polling the source without blocking on it
//! - running detection once per newly published frame
//! - handing records and rendered frames to the sinks
//! - restarting a stale source with backoff while keeping the last frame
//!   and the statistics available
//!
//! Sink failures are logged and never stop the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::ConnectError;
use crate::frame::{CameraSessionState, Frame};
use crate::ingest::{Backoff, FrameSource, RetryPolicy};
use crate::orchestrator::{DetectionOrchestrator, DetectionStats, FrameDetections};
use crate::sink::{render_overlays, DetectionSink, SnapshotSink};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);
const IDLE_WAIT: Duration = Duration::from_millis(10);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub struct Session {
    source: Box<dyn FrameSource>,
    orchestrator: DetectionOrchestrator,
    detection_sinks: Vec<Box<dyn DetectionSink>>,
    snapshot_sinks: Vec<Box<dyn SnapshotSink>>,
    stale_after: Duration,
    reconnect: Backoff,
    next_restart: Option<Instant>,
    last_seq: Option<u64>,
    last_health_log: Instant,
}

impl Session {
    pub fn new(source: Box<dyn FrameSource>, orchestrator: DetectionOrchestrator) -> Self {
        Self {
            source,
            orchestrator,
            detection_sinks: Vec::new(),
            snapshot_sinks: Vec::new(),
            stale_after: DEFAULT_STALE_AFTER,
            reconnect: Backoff::new(RetryPolicy::reconnect()),
            next_restart: None,
            last_seq: None,
            last_health_log: Instant::now(),
        }
    }

    pub fn with_detection_sink(mut self, sink: Box<dyn DetectionSink>) -> Self {
        self.detection_sinks.push(sink);
        self
    }

    pub fn with_snapshot_sink(mut self, sink: Box<dyn SnapshotSink>) -> Self {
        self.snapshot_sinks.push(sink);
        self
    }

    /// No frame for this long marks the source stale and triggers a restart.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = Backoff::new(policy);
        self
    }

    /// Start the source. Failure here is the operator-visible hard failure.
    pub fn start(&mut self) -> Result<(), ConnectError> {
        self.source.start()?;
        self.reconnect.reset();
        self.next_restart = None;
        Ok(())
    }

    pub fn stats(&self) -> &DetectionStats {
        self.orchestrator.stats()
    }

    pub fn source_state(&self) -> CameraSessionState {
        self.source.state()
    }

    /// Latest captured frame, also while the source is reconnecting.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.source.read()
    }

    /// One non-blocking iteration. Returns the detections of a newly
    /// processed frame, `None` when there was nothing new (or detection
    /// failed on it). Errors only once the reconnect budget is spent.
    pub fn step(&mut self) -> Result<Option<FrameDetections>, ConnectError> {
        self.maintain_source()?;

        let Some(frame) = self.source.read() else {
            return Ok(None);
        };
        if self.last_seq == Some(frame.seq()) {
            return Ok(None);
        }
        self.last_seq = Some(frame.seq());

        let detections = match self.orchestrator.process(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("session: frame {} skipped: {}", frame.seq(), err);
                return Ok(None);
            }
        };
        self.emit(&frame, &detections);
        Ok(Some(detections))
    }

    /// Loop until `shutdown` is set, then release the source.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), ConnectError> {
        log::info!("session: running with source {}", self.source.name());
        let result = loop {
            if shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            match self.step() {
                Ok(Some(_)) => {}
                Ok(None) => std::thread::sleep(IDLE_WAIT),
                Err(err) => break Err(err),
            }
            if self.last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                self.log_health();
                self.last_health_log = Instant::now();
            }
        };
        self.source.release();
        self.log_health();
        result
    }

    pub fn release(&mut self) {
        self.source.release();
    }

    fn maintain_source(&mut self) -> Result<(), ConnectError> {
        let session = self.source.session();
        if session.is_running() && !session.is_stale(self.stale_after) {
            return Ok(());
        }
        let now = Instant::now();
        if matches!(self.next_restart, Some(at) if now < at) {
            return Ok(());
        }

        log::warn!(
            "session: source {} stale, restarting (attempt {})",
            self.source.name(),
            self.reconnect.attempts() + 1
        );
        self.source.release();
        match self.source.start() {
            Ok(()) => {
                log::info!("session: source {} reconnected", self.source.name());
                self.reconnect.reset();
                self.next_restart = None;
                Ok(())
            }
            Err(err) => match self.reconnect.next_delay() {
                Some(delay) => {
                    log::warn!("session: reconnect failed: {}; retrying in {:?}", err, delay);
                    self.next_restart = Some(now + delay);
                    Ok(())
                }
                None => {
                    log::error!("session: giving up on source {}", self.source.name());
                    Err(err)
                }
            },
        }
    }

    fn emit(&mut self, frame: &Frame, detections: &FrameDetections) {
        let save = !detections.is_empty();
        let mut snapshot_path = None;
        if !self.snapshot_sinks.is_empty() {
            let rendered = render_overlays(frame, detections);
            for sink in &mut self.snapshot_sinks {
                match sink.submit(&rendered, save) {
                    Ok(path) => snapshot_path = snapshot_path.or(path),
                    Err(err) => log::warn!("session: snapshot sink failed: {:#}", err),
                }
            }
        }

        if detections.is_empty() {
            return;
        }
        let records = detections.records(snapshot_path.as_deref());
        for sink in &mut self.detection_sinks {
            if let Err(err) = sink.write(&records) {
                log::warn!("session: detection sink {} failed: {:#}", sink.name(), err);
            }
        }
    }

    fn log_health(&self) {
        let state = self.source.state();
        let stats = self.orchestrator.stats();
        log::info!(
            "session: running={} frames={} dropped={} rejected={} processed={} failed={} persons={} vehicles={} plates={}",
            state.is_running,
            state.frames_captured,
            state.frames_dropped,
            state.frames_rejected,
            stats.frames_processed,
            stats.frames_failed,
            stats.total_persons,
            stats.total_vehicles,
            stats.total_plates
        );
    }
}
