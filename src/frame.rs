//! Frames and the latest-frame cell.
//!
//! - `Frame`: owned RGB8 pixel buffer. `Clone` is a deep copy, so a frame handed
//!   across a thread boundary never aliases the producer's buffer.
//! - `FrameBuffer`: single-slot cell. `set` overwrites, `get` returns a copy.
//!   There is no queue: only the most recent frame matters.
//! - `CaptureSession`: the state one frame source shares with its producer
//!   threads (running flag, frame slot, counters). Reset on reconnect.

use image::RgbImage;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use crate::BoundingBox;

/// Fraction of the maximum pixel sum at or above which a frame counts as
/// saturated.
const SATURATION_RATIO: f64 = 0.99;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded image sample, 3 channels, 8 bits per channel.
#[derive(Clone)]
pub struct Frame {
    image: RgbImage,
    seq: u64,
    captured_at: SystemTime,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            seq: 0,
            captured_at: SystemTime::now(),
        }
    }

    /// Build a frame from packed RGB bytes. Returns `None` when the byte count
    /// does not match `width * height * 3`.
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, pixels).map(Self::new)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Publication sequence number assigned by `CaptureSession::publish`.
    /// Zero for frames that were never published.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Copy out a region. The region is clamped to the frame first.
    pub fn crop(&self, region: &BoundingBox) -> RgbImage {
        let r = region.clamp_to(self.width(), self.height());
        image::imageops::crop_imm(&self.image, r.x1, r.y1, r.width(), r.height()).to_image()
    }

    /// True when every pixel is black or the frame is (near) fully saturated.
    pub fn is_degenerate(&self) -> bool {
        pixels_are_degenerate(self.image.as_raw())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("seq", &self.seq)
            .finish()
    }
}

/// Liveness heuristic for decoder output.
///
/// A stalled or unhealthy stream tends to emit all-zero or all-white frames;
/// those are never published.
pub fn pixels_are_degenerate(pixels: &[u8]) -> bool {
    if pixels.is_empty() {
        return true;
    }
    let sum: u64 = pixels.iter().map(|&p| p as u64).sum();
    let ceiling = pixels.len() as u64 * 255;
    sum == 0 || sum as f64 >= ceiling as f64 * SATURATION_RATIO
}

// ----------------------------------------------------------------------------
// FrameBuffer: single-slot latest frame
// ----------------------------------------------------------------------------

/// Mutually exclusive single-slot cell holding the latest frame.
///
/// Cloning the handle shares the slot. The producer never blocks on a slow
/// consumer beyond the copy under the lock, and a consumer never sees a
/// partially written frame.
#[derive(Clone, Default)]
pub struct FrameBuffer {
    slot: Arc<Mutex<Option<Frame>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot unconditionally.
    pub fn set(&self, frame: Frame) {
        *self.lock() = Some(frame);
    }

    /// Copy of the current frame, or `None` if nothing was set yet.
    pub fn get(&self) -> Option<Frame> {
        self.lock().clone()
    }

    /// Sequence number of the current frame without copying pixels.
    pub fn latest_seq(&self) -> Option<u64> {
        self.lock().as_ref().map(Frame::seq)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    // A consumer that panicked while holding the lock must not wedge
    // acquisition; the slot only ever holds whole frames.
    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// CaptureSession: state shared between a source and its producer threads
// ----------------------------------------------------------------------------

/// Snapshot of a source's session state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CameraSessionState {
    pub is_running: bool,
    pub last_frame_at: Option<SystemTime>,
    /// Native stream resolution reported by the source, if known.
    pub detected_resolution: Option<(u32, u32)>,
    pub frames_captured: u64,
    /// Frames discarded because the stream delivered fewer bytes than a frame.
    pub frames_dropped: u64,
    /// Frames rejected by the liveness heuristic.
    pub frames_rejected: u64,
}

/// Handle to one source instance's session. Cloning shares it.
#[derive(Clone, Default)]
pub struct CaptureSession {
    inner: Arc<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    running: AtomicBool,
    buffer: FrameBuffer,
    next_seq: AtomicU64,
    cell: Mutex<StateCell>,
}

#[derive(Default)]
struct StateCell {
    state: CameraSessionState,
    started_at: Option<Instant>,
    last_frame_instant: Option<Instant>,
}

impl CaptureSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.inner.buffer
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::SeqCst);
        let mut cell = self.cell();
        cell.state.is_running = running;
        if running {
            cell.started_at = Some(Instant::now());
        }
    }

    /// Publish a frame to the slot, assigning its sequence number.
    pub fn publish(&self, mut frame: Frame) -> u64 {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        frame.seq = seq;
        let captured_at = frame.captured_at;
        self.inner.buffer.set(frame);

        let mut cell = self.cell();
        cell.state.frames_captured += 1;
        cell.state.last_frame_at = Some(captured_at);
        cell.last_frame_instant = Some(Instant::now());
        seq
    }

    /// Copy of the latest published frame.
    pub fn read(&self) -> Option<Frame> {
        self.inner.buffer.get()
    }

    pub fn has_frame(&self) -> bool {
        !self.inner.buffer.is_empty()
    }

    pub fn record_dropped(&self) {
        self.cell().state.frames_dropped += 1;
    }

    pub fn record_rejected(&self) {
        self.cell().state.frames_rejected += 1;
    }

    pub fn set_detected_resolution(&self, width: u32, height: u32) {
        self.cell().state.detected_resolution = Some((width, height));
    }

    pub fn state(&self) -> CameraSessionState {
        self.cell().state.clone()
    }

    /// True when no frame arrived within `grace` of the last frame (or of
    /// start, if none arrived yet).
    pub fn is_stale(&self, grace: Duration) -> bool {
        let cell = self.cell();
        match cell.last_frame_instant.or(cell.started_at) {
            Some(reference) => reference.elapsed() > grace,
            None => false,
        }
    }

    /// Reset state for a reconnect. The last frame stays in the slot so live
    /// consumers keep something to show.
    pub fn reset(&self) {
        let mut cell = self.cell();
        let running = cell.state.is_running;
        cell.state = CameraSessionState {
            is_running: running,
            ..CameraSessionState::default()
        };
        cell.started_at = None;
        cell.last_frame_instant = None;
    }

    fn cell(&self) -> MutexGuard<'_, StateCell> {
        self.inner.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_frame(width: u32, height: u32) -> Frame {
        let image = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        Frame::new(image)
    }

    #[test]
    fn get_without_set_is_empty() {
        let buffer = FrameBuffer::new();
        assert!(buffer.get().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn repeated_get_returns_independent_identical_copies() {
        let buffer = FrameBuffer::new();
        buffer.set(patterned_frame(16, 8));

        let mut first = buffer.get().expect("frame");
        let second = buffer.get().expect("frame");
        assert_eq!(first.image().as_raw(), second.image().as_raw());

        first.image_mut().put_pixel(0, 0, image::Rgb([1, 2, 3]));
        let third = buffer.get().expect("frame");
        assert_eq!(third.image().as_raw(), second.image().as_raw());
        assert_ne!(first.image().as_raw(), third.image().as_raw());
    }

    #[test]
    fn set_overwrites_previous_frame() {
        let buffer = FrameBuffer::new();
        buffer.set(patterned_frame(4, 4));
        buffer.set(patterned_frame(8, 2));

        let frame = buffer.get().expect("frame");
        assert_eq!((frame.width(), frame.height()), (8, 2));
    }

    #[test]
    fn black_and_saturated_frames_are_degenerate() {
        let black = Frame::from_raw(4, 4, vec![0; 48]).expect("frame");
        let white = Frame::from_raw(4, 4, vec![255; 48]).expect("frame");
        let normal = patterned_frame(4, 4);

        assert!(black.is_degenerate());
        assert!(white.is_degenerate());
        assert!(!normal.is_degenerate());
    }

    #[test]
    fn from_raw_rejects_wrong_length() {
        assert!(Frame::from_raw(4, 4, vec![10; 47]).is_none());
    }

    #[test]
    fn crop_clamps_region_to_frame() {
        let frame = patterned_frame(20, 10);
        let crop = frame.crop(&BoundingBox::new(15, 5, 40, 40));
        assert_eq!(crop.dimensions(), (5, 5));
        assert_eq!(crop.get_pixel(0, 0), frame.image().get_pixel(15, 5));
    }

    #[test]
    fn publish_assigns_increasing_sequence_numbers() {
        let session = CaptureSession::new();
        session.set_running(true);

        let a = session.publish(patterned_frame(4, 4));
        let b = session.publish(patterned_frame(4, 4));
        assert!(b > a);
        assert_eq!(session.read().expect("frame").seq(), b);

        let state = session.state();
        assert_eq!(state.frames_captured, 2);
        assert!(state.last_frame_at.is_some());
        assert!(state.is_running);
    }

    #[test]
    fn reset_keeps_last_frame_but_clears_counters() {
        let session = CaptureSession::new();
        session.set_running(true);
        session.publish(patterned_frame(4, 4));
        session.record_dropped();
        session.set_detected_resolution(1920, 1080);

        session.reset();

        let state = session.state();
        assert_eq!(state.frames_captured, 0);
        assert_eq!(state.frames_dropped, 0);
        assert_eq!(state.detected_resolution, None);
        assert!(session.has_frame());
    }

    #[test]
    fn session_goes_stale_without_frames() {
        let session = CaptureSession::new();
        assert!(!session.is_stale(Duration::ZERO));

        session.set_running(true);
        std::thread::sleep(Duration::from_millis(5));
        assert!(session.is_stale(Duration::from_millis(1)));
        assert!(!session.is_stale(Duration::from_secs(60)));
    }
}
