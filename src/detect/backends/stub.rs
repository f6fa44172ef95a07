use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::{ObjectDetector, OcrEngine, OcrSpan, RawDetection};
use crate::frame::Frame;

enum Scripted<T> {
    Output(T),
    Failure(String),
}

/// Scripted detector for tests and dry runs.
///
/// Queued responses are returned one per frame; once the queue is empty the
/// steady-state response is returned for every frame.
pub struct StubDetector {
    queued: VecDeque<Scripted<Vec<RawDetection>>>,
    steady: Vec<RawDetection>,
    calls: u64,
}

impl StubDetector {
    /// Detector that never sees anything.
    pub fn empty() -> Self {
        Self::fixed(Vec::new())
    }

    /// Detector that reports the same boxes on every frame.
    pub fn fixed(detections: Vec<RawDetection>) -> Self {
        Self {
            queued: VecDeque::new(),
            steady: detections,
            calls: 0,
        }
    }

    /// Queue a one-shot response.
    pub fn then(mut self, detections: Vec<RawDetection>) -> Self {
        self.queued.push_back(Scripted::Output(detections));
        self
    }

    /// Queue a one-shot failure.
    pub fn then_fail(mut self, reason: &str) -> Self {
        self.queued.push_back(Scripted::Failure(reason.to_string()));
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::empty()
    }
}

impl ObjectDetector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
        self.calls += 1;
        match self.queued.pop_front() {
            Some(Scripted::Output(detections)) => Ok(detections),
            Some(Scripted::Failure(reason)) => Err(anyhow!(reason)),
            None => Ok(self.steady.clone()),
        }
    }
}

/// Scripted OCR engine.
///
/// Records the size of every image it is asked to read; the log handle can be
/// kept by a test after the engine is boxed into a pipeline.
pub struct StubOcr {
    queued: VecDeque<Scripted<Vec<OcrSpan>>>,
    steady: Vec<OcrSpan>,
    seen: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl StubOcr {
    /// Engine that never recognizes anything.
    pub fn silent() -> Self {
        Self {
            queued: VecDeque::new(),
            steady: Vec::new(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Engine that reads the same text from every image.
    pub fn reading(text: &str, confidence: f32) -> Self {
        let mut ocr = Self::silent();
        ocr.steady = vec![OcrSpan::new(text, confidence)];
        ocr
    }

    /// Queue a one-shot response.
    pub fn then(mut self, spans: Vec<OcrSpan>) -> Self {
        self.queued.push_back(Scripted::Output(spans));
        self
    }

    /// Queue a one-shot failure.
    pub fn then_fail(mut self, reason: &str) -> Self {
        self.queued.push_back(Scripted::Failure(reason.to_string()));
        self
    }

    /// Shared log of `(width, height)` for every image recognized.
    pub fn seen_sizes(&self) -> Arc<Mutex<Vec<(u32, u32)>>> {
        self.seen.clone()
    }
}

impl OcrEngine for StubOcr {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn recognize(&mut self, image: &RgbImage) -> Result<Vec<OcrSpan>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(image.dimensions());
        match self.queued.pop_front() {
            Some(Scripted::Output(spans)) => Ok(spans),
            Some(Scripted::Failure(reason)) => Err(anyhow!(reason)),
            None => Ok(self.steady.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    #[test]
    fn detector_plays_queue_then_steady_state() {
        let car = RawDetection::new(2, 0.9, BoundingBox::new(10, 10, 50, 40));
        let mut detector = StubDetector::fixed(vec![car])
            .then(Vec::new())
            .then_fail("model crashed");
        let frame = Frame::new(RgbImage::new(64, 64));

        assert!(detector.detect(&frame).unwrap().is_empty());
        assert!(detector.detect(&frame).is_err());
        assert_eq!(detector.detect(&frame).unwrap(), vec![car]);
        assert_eq!(detector.calls(), 3);
    }

    #[test]
    fn ocr_logs_image_sizes() {
        let mut ocr = StubOcr::reading("29A12345", 0.9);
        let log = ocr.seen_sizes();

        let spans = ocr.recognize(&RgbImage::new(120, 100)).unwrap();
        assert_eq!(spans, vec![OcrSpan::new("29A12345", 0.9)]);
        assert_eq!(*log.lock().unwrap(), vec![(120, 100)]);
    }
}
