//! Plate Watch
//!
//! This crate keeps a live camera frame available and reads license plates
//! from the vehicles seen in it.
//!
//! # Architecture
//!
//! Data flows leaf-first through five stages:
//!
//! 1. **Frame sources** (`ingest`): decoder subprocess (RTSP), HTTP snapshot
//!    polling, local capture and a synthetic source, all behind `FrameSource`.
//! 2. **Frame buffer** (`frame`): single-slot latest-frame cell shared between
//!    the producer thread and its consumers.
//! 3. **Plate candidate locator** (`plate::locator`): classical image
//!    processing proposing plate-shaped regions.
//! 4. **Plate text pipeline** (`plate::pipeline`): OCR, normalization,
//!    grammar validation and confidence assignment.
//! 5. **Detection orchestrator** (`orchestrator`): per-frame control flow
//!    around the external object detector.
//!
//! `session::Session` binds a source, the orchestrator and the sinks into the
//! acquisition/detection loop run by `platewatchd`.
//!
//! # Module Structure
//!
//! - `frame`: Frame, FrameBuffer, CaptureSession
//! - `ingest`: Frame sources, source factory, retry/timer policy
//! - `detect`: Object detector and OCR capability traits plus backends
//! - `plate`: Candidate locator, text policy, plate text pipeline
//! - `orchestrator`, `session`, `sink`, `config`
//! - Core types: BoundingBox

use serde::{Deserialize, Serialize};

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod orchestrator;
pub mod plate;
pub mod session;
pub mod sink;

pub use config::PlateWatchConfig;
pub use detect::{
    Detection, DetectionKind, ObjectDetector, OcrEngine, OcrSpan, RawDetection, StubDetector,
    StubOcr, VehicleClass,
};
pub use error::{ConnectError, DetectionError};
pub use frame::{CameraSessionState, CaptureSession, Frame, FrameBuffer};
pub use ingest::{open_source, FrameSource, RetryPolicy, Sleeper, SourceDescriptor};
pub use orchestrator::{DetectionOrchestrator, DetectionSettings, DetectionStats, FrameDetections};
pub use plate::{
    PlateCandidate, PlateCandidateLocator, PlateReading, PlateTextPipeline, PlateTextPolicy,
};
pub use session::Session;
pub use sink::{DetectionRecord, DetectionSink, SnapshotSink};

// -------------------- Bounding Boxes --------------------

/// Axis-aligned box in pixel coordinates.
///
/// `x2`/`y2` are exclusive: a box covers columns `x1..x2` and rows `y1..y2`,
/// so `width() == x2 - x1`. Construction keeps `x2 >= x1` and `y2 >= y1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Box from a left/top corner plus width and height.
    pub fn from_xywh(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self::new(x, y, x.saturating_add(w), y.saturating_add(h))
    }

    /// Box from floating point corners (detector output), clamped to a
    /// `width`x`height` frame.
    pub fn from_f32_clamped(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Self {
        let clamp = |v: f32, max: u32| -> u32 {
            if !v.is_finite() || v <= 0.0 {
                0
            } else {
                (v as u32).min(max)
            }
        };
        Self::new(
            clamp(x1, width),
            clamp(y1, height),
            clamp(x2, width),
            clamp(y2, height),
        )
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Width over height; zero for a degenerate box.
    pub fn aspect_ratio(&self) -> f64 {
        if self.height() == 0 {
            0.0
        } else {
            self.width() as f64 / self.height() as f64
        }
    }

    /// Grow each side by `ratio` of the box's own width/height, without
    /// clamping. Coordinates may become negative.
    pub fn expanded_unclamped(&self, ratio: f64) -> (i64, i64, i64, i64) {
        let dx = self.width() as f64 * ratio;
        let dy = self.height() as f64 * ratio;
        (
            (self.x1 as f64 - dx).floor() as i64,
            (self.y1 as f64 - dy).floor() as i64,
            (self.x2 as f64 + dx).floor() as i64,
            (self.y2 as f64 + dy).floor() as i64,
        )
    }

    /// Grow each side by `ratio` and clamp to a `width`x`height` frame.
    pub fn expand(&self, ratio: f64, width: u32, height: u32) -> Self {
        let (x1, y1, x2, y2) = self.expanded_unclamped(ratio);
        let clamp = |v: i64, max: u32| v.clamp(0, max as i64) as u32;
        Self::new(
            clamp(x1, width),
            clamp(y1, height),
            clamp(x2, width),
            clamp(y2, height),
        )
    }

    /// Clamp to a `width`x`height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self::new(
            self.x1.min(width),
            self.y1.min(height),
            self.x2.min(width),
            self.y2.min(height),
        )
    }

    /// Intersection over union; zero when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let intersection = if x2 > x1 && y2 > y1 {
            (x2 - x1) as u64 * (y2 - y1) as u64
        } else {
            0
        };
        let union = self.area() + other.area() - intersection;
        if union == 0 {
            0.0
        } else {
            intersection as f32 / union as f32
        }
    }

    /// Shift by an origin offset, e.g. crop-space to frame-space.
    pub fn translate(&self, dx: u32, dy: u32) -> Self {
        Self::new(
            self.x1.saturating_add(dx),
            self.y1.saturating_add(dy),
            self.x2.saturating_add(dx),
            self.y2.saturating_add(dy),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vehicle_box_expands_by_ratio_on_each_side() {
        let vehicle = BoundingBox::new(100, 100, 200, 200);

        assert_eq!(vehicle.expanded_unclamped(0.10), (90, 90, 210, 210));
        assert_eq!(
            vehicle.expand(0.10, 1000, 1000),
            BoundingBox::new(90, 90, 210, 210)
        );
    }

    #[test]
    fn expansion_clamps_at_frame_edges() {
        let vehicle = BoundingBox::new(5, 10, 640, 480);
        let expanded = vehicle.expand(0.10, 640, 480);

        assert_eq!(expanded, BoundingBox::new(0, 0, 640, 480));
    }

    #[test]
    fn crop_space_box_translates_to_frame_space() {
        let in_crop = BoundingBox::from_xywh(5, 5, 50, 20);
        let in_frame = in_crop.translate(90, 90);

        assert_eq!(in_frame, BoundingBox::new(95, 95, 145, 115));
    }

    #[test]
    fn constructor_orders_corners() {
        let b = BoundingBox::new(50, 40, 10, 20);
        assert_eq!(b, BoundingBox::new(10, 20, 50, 40));
        assert_eq!(b.width(), 40);
        assert_eq!(b.height(), 20);
        assert!((b.aspect_ratio() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn float_boxes_clamp_into_frame() {
        let b = BoundingBox::from_f32_clamped(-12.5, 3.9, 700.2, 470.0, 640, 480);
        assert_eq!(b, BoundingBox::new(0, 3, 640, 470));

        let nan = BoundingBox::from_f32_clamped(f32::NAN, 0.0, 10.0, 10.0, 640, 480);
        assert_eq!(nan.x1, 0);
    }
}
