//! Plate text pipeline.
//!
//! Turns a vehicle crop into at most one validated `PlateReading`.
//!
//! Order of attempts:
//! 1. whole-crop OCR on an upscaled copy, then localization of the accepted
//!    text via `PlateCandidateLocator` (or an estimated lower-band box),
//! 2. candidate-first fallback: binarized top candidate, OCR again.
//!
//! This module MUST NOT:
//! - emit text that failed normalization or grammar validation
//! - report crop-space boxes as frame-space (the orchestrator translates)

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::contrast::otsu_level;
use serde::Serialize;

use super::locator::{PlateCandidate, PlateCandidateLocator};
use super::text::PlateTextPolicy;
use crate::detect::OcrEngine;
use crate::BoundingBox;

/// Crops smaller than this on either axis never reach OCR.
pub const MIN_CROP_SIDE: u32 = 30;
/// Whole-crop OCR input is upscaled to at least this height.
const OCR_MIN_HEIGHT: u32 = 100;
/// Fallback candidate sub-images are upscaled to at least this height.
const CANDIDATE_MIN_HEIGHT: u32 = 50;

const LOCATED_CONFIDENCE: f32 = 0.85;
const FALLBACK_CONFIDENCE: f32 = 0.80;
const ESTIMATED_CONFIDENCE: f32 = 0.75;

/// Validated plate text with an optional location.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlateReading {
    pub text: String,
    pub confidence: f32,
    /// Crop-space when produced here, frame-space once attached to a frame
    /// result.
    pub bbox: Option<BoundingBox>,
}

/// OCR, normalization, validation and confidence assignment for one crop.
pub struct PlateTextPipeline {
    ocr: Option<Box<dyn OcrEngine>>,
    locator: PlateCandidateLocator,
    policy: PlateTextPolicy,
}

impl PlateTextPipeline {
    /// Pipeline with default locator and text policy. Without an OCR engine
    /// every read returns `None`.
    pub fn new(ocr: Option<Box<dyn OcrEngine>>) -> Self {
        Self {
            ocr,
            locator: PlateCandidateLocator::default(),
            policy: PlateTextPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PlateTextPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_locator(mut self, locator: PlateCandidateLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn has_ocr(&self) -> bool {
        self.ocr.is_some()
    }

    pub fn policy(&self) -> &PlateTextPolicy {
        &self.policy
    }

    /// Read the plate of one vehicle crop.
    pub fn read(&mut self, crop: &RgbImage) -> Option<PlateReading> {
        self.ocr.as_ref()?;
        let (width, height) = crop.dimensions();
        if width < MIN_CROP_SIDE || height < MIN_CROP_SIDE {
            log::debug!("plate: crop {}x{} below minimum size", width, height);
            return None;
        }

        let upscaled = upscale_to_height(crop, OCR_MIN_HEIGHT);
        if let Some(raw) = self.recognize(upscaled.as_ref().unwrap_or(crop)) {
            if let Some(text) = self.policy.accept(&raw) {
                return Some(self.locate_reading(crop, text));
            }
            log::debug!("plate: whole-crop text {:?} rejected", raw);
        }

        // Empty, failed or rejected whole-crop OCR all fall through.
        self.read_top_candidate(crop)
    }

    fn locate_reading(&self, crop: &RgbImage, text: String) -> PlateReading {
        match self.locator.locate(crop).first() {
            Some(candidate) => PlateReading {
                text,
                confidence: LOCATED_CONFIDENCE,
                bbox: Some(candidate.bbox),
            },
            None => PlateReading {
                text,
                confidence: ESTIMATED_CONFIDENCE,
                bbox: Some(estimated_plate_box(crop.width(), crop.height())),
            },
        }
    }

    fn read_top_candidate(&mut self, crop: &RgbImage) -> Option<PlateReading> {
        let gray = image::imageops::grayscale(crop);
        let candidate: PlateCandidate = *self.locator.locate_gray(&gray).first()?;
        let roi = candidate.bbox.clamp_to(gray.width(), gray.height());
        if roi.is_empty() {
            return None;
        }
        let region =
            image::imageops::crop_imm(&gray, roi.x1, roi.y1, roi.width(), roi.height()).to_image();
        let region = upscale_gray_to_height(region, CANDIDATE_MIN_HEIGHT);
        let binary = DynamicImage::ImageLuma8(binarize(&region)).to_rgb8();

        let raw = self.recognize(&binary)?;
        match self.policy.accept(&raw) {
            Some(text) => Some(PlateReading {
                text,
                confidence: FALLBACK_CONFIDENCE,
                bbox: Some(candidate.bbox),
            }),
            None => {
                log::debug!("plate: candidate text {:?} rejected", raw);
                None
            }
        }
    }

    /// OCR spans joined with single spaces; `None` on empty output or engine
    /// failure.
    fn recognize(&mut self, image: &RgbImage) -> Option<String> {
        let ocr = self.ocr.as_mut()?;
        let spans = match ocr.recognize(image) {
            Ok(spans) => spans,
            Err(err) => {
                log::warn!("plate: OCR engine {} failed: {:#}", ocr.name(), err);
                return None;
            }
        };
        let joined = spans
            .iter()
            .map(|span| span.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}

/// Lower-middle band of a vehicle crop where plates usually sit.
pub fn estimated_plate_box(width: u32, height: u32) -> BoundingBox {
    let w = width as f64;
    let h = height as f64;
    BoundingBox::from_xywh(
        (w * 0.1) as u32,
        (h * 0.6) as u32,
        (w * 0.8) as u32,
        (h * 0.25) as u32,
    )
}

/// Upscaled copy when `image` is shorter than `min_height`, `None` otherwise.
fn upscale_to_height(image: &RgbImage, min_height: u32) -> Option<RgbImage> {
    let (width, height) = image.dimensions();
    if height >= min_height {
        return None;
    }
    let scale = min_height as f64 / height as f64;
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    Some(image::imageops::resize(
        image,
        new_width,
        min_height,
        FilterType::Triangle,
    ))
}

fn upscale_gray_to_height(image: GrayImage, min_height: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if height >= min_height {
        return image;
    }
    let scale = min_height as f64 / height as f64;
    let new_width = ((width as f64 * scale) as u32).max(1);
    image::imageops::resize(&image, new_width, min_height, FilterType::Triangle)
}

/// Global Otsu threshold: pixels above the level become white.
fn binarize(image: &GrayImage) -> GrayImage {
    let level = otsu_level(image);
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if image.get_pixel(x, y)[0] > level {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}
