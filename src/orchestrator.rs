//! Per-frame detection orchestration.
//!
//! The orchestrator is responsible for:
//! - invoking the object detector on a frame
//! - thresholding and classifying raw boxes into persons and vehicles
//! - cropping each vehicle (expanded, clamped) and reading its plate
//! - translating plate boxes from crop space to frame space
//! - keeping running totals
//!
//! It MUST NOT:
//! - let a detector failure escape as anything but a per-frame error
//! - attach a plate to any vehicle but the one whose crop produced it

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use serde::Serialize;

use crate::detect::{Detection, DetectionKind, ObjectDetector, VehicleClass};
use crate::error::DetectionError;
use crate::frame::Frame;
use crate::plate::{PlateReading, PlateTextPipeline};
use crate::sink::DetectionRecord;
use crate::BoundingBox;

pub const DEFAULT_PERSON_THRESHOLD: f32 = 0.5;
pub const DEFAULT_VEHICLE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_EXPAND_RATIO: f64 = 0.10;
/// COCO `person`.
pub const DEFAULT_PERSON_CLASSES: [u32; 1] = [0];
/// COCO `bicycle`, `car`, `motorcycle`, `bus`, `truck`.
pub const DEFAULT_VEHICLE_CLASSES: [u32; 5] = [1, 2, 3, 5, 7];

/// Thresholds and class tables applied to raw detector output.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionSettings {
    pub person_threshold: f32,
    pub vehicle_threshold: f32,
    pub person_classes: BTreeSet<u32>,
    pub vehicle_classes: BTreeSet<u32>,
    /// Vehicle subtype per class id; ids missing here report `Other`.
    pub vehicle_labels: BTreeMap<u32, VehicleClass>,
    /// Fraction of the vehicle box added on each side before cropping.
    pub expand_ratio: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            person_threshold: DEFAULT_PERSON_THRESHOLD,
            vehicle_threshold: DEFAULT_VEHICLE_THRESHOLD,
            person_classes: DEFAULT_PERSON_CLASSES.into_iter().collect(),
            vehicle_classes: DEFAULT_VEHICLE_CLASSES.into_iter().collect(),
            vehicle_labels: VehicleClass::coco_labels(),
            expand_ratio: DEFAULT_EXPAND_RATIO,
        }
    }
}

/// Plate read in this pass, attributed by vehicle index.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlateDetection {
    /// Index into `FrameDetections::detections`.
    pub vehicle_index: usize,
    /// Frame-space box of the owning vehicle.
    pub vehicle_box: BoundingBox,
    /// Frame-space reading.
    pub reading: PlateReading,
}

/// Result of one detection pass.
#[derive(Clone, Debug)]
pub struct FrameDetections {
    pub frame_seq: u64,
    pub captured_at: SystemTime,
    /// Accepted detections in detector order.
    pub detections: Vec<Detection>,
    pub plates: Vec<PlateDetection>,
}

impl FrameDetections {
    pub fn persons(&self) -> impl Iterator<Item = &Detection> {
        self.detections
            .iter()
            .filter(|d| d.kind == DetectionKind::Person)
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &Detection> {
        self.detections
            .iter()
            .filter(|d| d.kind == DetectionKind::Vehicle)
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Records for the persistence sink, one per detection.
    pub fn records(&self, snapshot_path: Option<&str>) -> Vec<DetectionRecord> {
        self.detections
            .iter()
            .map(|detection| {
                DetectionRecord::from_detection(detection, self.captured_at, snapshot_path)
            })
            .collect()
    }
}

/// Running totals, readable between frames.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionStats {
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub total_persons: u64,
    pub total_vehicles: u64,
    pub total_plates: u64,
    /// Capture time of the last frame with any accepted detection.
    pub last_detection: Option<SystemTime>,
}

/// Binds the object detector and the plate pipeline.
pub struct DetectionOrchestrator {
    detector: Box<dyn ObjectDetector>,
    plates: PlateTextPipeline,
    settings: DetectionSettings,
    stats: DetectionStats,
}

impl DetectionOrchestrator {
    pub fn new(
        detector: Box<dyn ObjectDetector>,
        plates: PlateTextPipeline,
        settings: DetectionSettings,
    ) -> Self {
        Self {
            detector,
            plates,
            settings,
            stats: DetectionStats::default(),
        }
    }

    pub fn stats(&self) -> &DetectionStats {
        &self.stats
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    /// Run one detection pass. On error the frame contributes nothing but
    /// the failure count.
    pub fn process(&mut self, frame: &Frame) -> Result<FrameDetections, DetectionError> {
        let raw = match self.detector.detect(frame) {
            Ok(raw) => raw,
            Err(reason) => {
                self.stats.frames_failed += 1;
                return Err(DetectionError::Detector {
                    backend: self.detector.name(),
                    reason,
                });
            }
        };

        let (width, height) = (frame.width(), frame.height());
        let mut detections = Vec::new();
        let mut plates = Vec::new();

        for candidate in raw {
            let class_id = candidate.class_id;
            let bbox = candidate.bbox.clamp_to(width, height);

            if self.settings.person_classes.contains(&class_id) {
                if candidate.confidence >= self.settings.person_threshold {
                    detections.push(Detection::person(bbox, candidate.confidence));
                }
            } else if self.settings.vehicle_classes.contains(&class_id) {
                if candidate.confidence < self.settings.vehicle_threshold {
                    continue;
                }
                let class = self
                    .settings
                    .vehicle_labels
                    .get(&class_id)
                    .copied()
                    .unwrap_or(VehicleClass::Other);
                let mut vehicle = Detection::vehicle(bbox, candidate.confidence, class);

                if let Some(reading) = self.read_plate(frame, &bbox) {
                    plates.push(PlateDetection {
                        vehicle_index: detections.len(),
                        vehicle_box: bbox,
                        reading: reading.clone(),
                    });
                    vehicle.plate = Some(reading);
                }
                detections.push(vehicle);
            }
        }

        let result = FrameDetections {
            frame_seq: frame.seq(),
            captured_at: frame.captured_at(),
            detections,
            plates,
        };
        self.record(&result);
        Ok(result)
    }

    /// Crop the expanded vehicle region and read a plate from it, with the
    /// reading's box moved into frame space.
    fn read_plate(&mut self, frame: &Frame, vehicle: &BoundingBox) -> Option<PlateReading> {
        if !self.plates.has_ocr() {
            return None;
        }
        let region = vehicle.expand(self.settings.expand_ratio, frame.width(), frame.height());
        if region.is_empty() {
            return None;
        }
        let crop = frame.crop(&region);
        let mut reading = self.plates.read(&crop)?;
        reading.bbox = reading.bbox.map(|b| b.translate(region.x1, region.y1));
        log::info!(
            "plate {} (confidence {:.2}) on vehicle at ({}, {})",
            reading.text,
            reading.confidence,
            vehicle.x1,
            vehicle.y1
        );
        Some(reading)
    }

    fn record(&mut self, result: &FrameDetections) {
        let persons = result.persons().count() as u64;
        let vehicles = result.vehicles().count() as u64;
        self.stats.frames_processed += 1;
        self.stats.total_persons += persons;
        self.stats.total_vehicles += vehicles;
        self.stats.total_plates += result.plates.len() as u64;
        if !result.is_empty() {
            self.stats.last_detection = Some(result.captured_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{RawDetection, StubDetector, StubOcr};
    use crate::plate::PlateCandidateLocator;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn orchestrator(detector: StubDetector, ocr: Option<StubOcr>) -> DetectionOrchestrator {
        let ocr = ocr.map(|ocr| Box::new(ocr) as Box<dyn crate::detect::OcrEngine>);
        DetectionOrchestrator::new(
            Box::new(detector),
            PlateTextPipeline::new(ocr),
            DetectionSettings::default(),
        )
    }

    fn street_frame() -> Frame {
        let mut image = RgbImage::from_pixel(640, 480, Rgb([30, 30, 30]));
        draw_filled_rect_mut(
            &mut image,
            Rect::at(140, 200).of_size(120, 40),
            Rgb([235, 235, 235]),
        );
        Frame::new(image)
    }

    #[test]
    fn vehicle_with_plate_yields_one_attributed_reading() -> anyhow::Result<()> {
        let car = BoundingBox::new(100, 100, 300, 260);
        let detector = StubDetector::fixed(vec![RawDetection::new(2, 0.9, car)]);
        let mut orchestrator = orchestrator(detector, Some(StubOcr::reading("29A-12345", 0.8)));
        let frame = street_frame();

        let result = orchestrator.process(&frame)?;

        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.plates.len(), 1);
        let vehicle = &result.detections[0];
        let plate = &result.plates[0];
        assert_eq!(vehicle.kind, DetectionKind::Vehicle);
        assert_eq!(vehicle.vehicle_class, Some(VehicleClass::Car));
        assert_eq!(plate.vehicle_index, 0);
        assert_eq!(plate.vehicle_box, vehicle.bbox);
        assert_eq!(vehicle.plate.as_ref(), Some(&plate.reading));
        assert_eq!(plate.reading.text, "29A-12345");
        assert_eq!(plate.reading.confidence, 0.85);

        // Crop origin is the expanded box corner.
        let region = car.expand(0.10, 640, 480);
        assert_eq!(region, BoundingBox::new(80, 84, 320, 276));
        let in_crop = PlateCandidateLocator::default().locate(&frame.crop(&region))[0].bbox;
        assert_eq!(plate.reading.bbox, Some(in_crop.translate(80, 84)));
        Ok(())
    }

    #[test]
    fn thresholds_and_class_sets_filter_raw_boxes() -> anyhow::Result<()> {
        let b = BoundingBox::new(10, 10, 60, 90);
        let detector = StubDetector::fixed(vec![
            RawDetection::new(0, 0.4, b),
            RawDetection::new(0, 0.6, b),
            RawDetection::new(7, 0.5, b),
            RawDetection::new(3, 0.49, b),
            RawDetection::new(16, 0.99, b),
            RawDetection::new(4, 0.99, b),
        ]);
        let mut orchestrator = orchestrator(detector, None);

        let result = orchestrator.process(&Frame::new(RgbImage::new(320, 240)))?;
        assert_eq!(result.persons().count(), 1);
        let vehicles: Vec<_> = result.vehicles().collect();
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].vehicle_class, Some(VehicleClass::Truck));
        assert!(result.plates.is_empty());

        let stats = orchestrator.stats();
        assert_eq!(stats.total_persons, 1);
        assert_eq!(stats.total_vehicles, 1);
        assert_eq!(stats.total_plates, 0);
        Ok(())
    }

    #[test]
    fn unlabelled_vehicle_ids_are_other() -> anyhow::Result<()> {
        let detector = StubDetector::fixed(vec![RawDetection::new(
            9,
            0.9,
            BoundingBox::new(0, 0, 20, 20),
        )]);
        let settings = DetectionSettings {
            vehicle_classes: [2, 9].into_iter().collect(),
            ..DetectionSettings::default()
        };
        let mut orchestrator =
            DetectionOrchestrator::new(Box::new(detector), PlateTextPipeline::new(None), settings);

        let result = orchestrator.process(&Frame::new(RgbImage::new(64, 64)))?;
        assert_eq!(result.detections[0].vehicle_class, Some(VehicleClass::Other));
        Ok(())
    }

    #[test]
    fn detector_failure_drops_only_that_frame() -> anyhow::Result<()> {
        let person = RawDetection::new(0, 0.9, BoundingBox::new(1, 1, 10, 30));
        let detector = StubDetector::fixed(vec![person]).then_fail("inference crashed");
        let mut orchestrator = orchestrator(detector, None);
        let frame = Frame::new(RgbImage::new(64, 64));

        let err = orchestrator.process(&frame).unwrap_err();
        assert!(matches!(err, DetectionError::Detector { backend: "stub", .. }));
        assert_eq!(orchestrator.stats().frames_failed, 1);
        assert_eq!(orchestrator.stats().last_detection, None);

        let result = orchestrator.process(&frame)?;
        assert_eq!(result.persons().count(), 1);
        assert_eq!(orchestrator.stats().frames_processed, 1);
        assert_eq!(
            orchestrator.stats().last_detection,
            Some(frame.captured_at())
        );
        Ok(())
    }

    #[test]
    fn empty_frames_leave_last_detection_alone() -> anyhow::Result<()> {
        let mut orchestrator = orchestrator(StubDetector::empty(), None);
        let result = orchestrator.process(&Frame::new(RgbImage::new(32, 32)))?;
        assert!(result.is_empty());
        assert_eq!(orchestrator.stats().frames_processed, 1);
        assert_eq!(orchestrator.stats().last_detection, None);
        Ok(())
    }

    #[test]
    fn boxes_outside_the_frame_are_clamped() -> anyhow::Result<()> {
        let detector = StubDetector::fixed(vec![RawDetection::new(
            0,
            0.9,
            BoundingBox::new(50, 50, 500, 500),
        )]);
        let mut orchestrator = orchestrator(detector, None);
        let result = orchestrator.process(&Frame::new(RgbImage::new(100, 80)))?;
        assert_eq!(result.detections[0].bbox, BoundingBox::new(50, 50, 100, 80));
        Ok(())
    }
}
