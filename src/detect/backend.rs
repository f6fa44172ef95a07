use anyhow::Result;
use image::RgbImage;

use crate::frame::Frame;
use crate::BoundingBox;

/// One box reported by an object detector, before thresholding and
/// classification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    /// Model class id (COCO ids for the bundled defaults).
    pub class_id: u32,
    pub confidence: f32,
    /// Frame-space box.
    pub bbox: BoundingBox,
}

impl RawDetection {
    pub fn new(class_id: u32, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            confidence,
            bbox,
        }
    }
}

/// Object detector capability.
///
/// Implementations treat the frame as read-only and must not hold on to it
/// past the `detect` call. Errors are per-frame: the caller drops that frame
/// from detection and keeps going.
pub trait ObjectDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Boxes are in frame coordinates.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Recognized text span with its engine confidence in [0, 1].
#[derive(Clone, Debug, PartialEq)]
pub struct OcrSpan {
    pub text: String,
    pub confidence: f32,
}

impl OcrSpan {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Text recognition capability.
pub trait OcrEngine: Send {
    fn name(&self) -> &'static str;

    /// Recognize text in an image region, in reading order.
    fn recognize(&mut self, image: &RgbImage) -> Result<Vec<OcrSpan>>;
}
