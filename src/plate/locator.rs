//! Plate candidate localization.
//!
//! Classical pipeline, no text reading:
//! intensity → edge-preserving smoothing → CLAHE → Canny → contours →
//! geometric filtering of the largest contours.

use image::{GrayImage, RgbImage};
use imageproc::contours::find_contours;
use imageproc::edges::canny;
use imageproc::filter::median_filter;
use imageproc::geometry::convex_hull;
use imageproc::point::Point;
use serde::Serialize;

use super::clahe::Clahe;
use crate::BoundingBox;

/// Plate-shaped region proposed by the locator.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PlateCandidate {
    /// Box in the coordinate space of the image passed to `locate`.
    pub bbox: BoundingBox,
    /// Contour area over convex hull area.
    pub solidity: f64,
    /// Bounding box width over height.
    pub aspect_ratio: f64,
}

/// Geometric acceptance rules and preprocessing parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct PlateCandidateLocator {
    /// How many of the largest contours are examined.
    pub max_contours: usize,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    /// Minimum bounding box area in px².
    pub min_area: u64,
    /// Solidity must be strictly greater than this.
    pub min_solidity: f64,
    pub smoothing_radius: u32,
    pub clahe: Clahe,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for PlateCandidateLocator {
    fn default() -> Self {
        Self {
            max_contours: 15,
            min_aspect_ratio: 1.5,
            max_aspect_ratio: 5.5,
            min_area: 200,
            min_solidity: 0.5,
            smoothing_radius: 2,
            clahe: Clahe::default(),
            canny_low: 30.0,
            canny_high: 200.0,
        }
    }
}

impl PlateCandidateLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates in descending contour-area order.
    pub fn locate(&self, image: &RgbImage) -> Vec<PlateCandidate> {
        self.locate_gray(&image::imageops::grayscale(image))
    }

    pub fn locate_gray(&self, gray: &GrayImage) -> Vec<PlateCandidate> {
        if gray.width() < 3 || gray.height() < 3 {
            return Vec::new();
        }
        let edges = self.edge_map(gray);

        let mut contours: Vec<(f64, Vec<Point<i32>>)> = find_contours::<i32>(&edges)
            .into_iter()
            .filter(|contour| !contour.points.is_empty())
            .map(|contour| (polygon_area(&contour.points), contour.points))
            .collect();
        contours.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        contours
            .iter()
            .take(self.max_contours)
            .filter_map(|(area, points)| self.evaluate(points, *area))
            .collect()
    }

    /// Edge map fed to contour extraction.
    pub fn edge_map(&self, gray: &GrayImage) -> GrayImage {
        let smoothed = median_filter(gray, self.smoothing_radius, self.smoothing_radius);
        let enhanced = self.clahe.apply(&smoothed);
        canny(&enhanced, self.canny_low, self.canny_high)
    }

    /// Apply the geometric rules to one contour.
    pub fn evaluate(&self, points: &[Point<i32>], contour_area: f64) -> Option<PlateCandidate> {
        let bbox = bounding_rect(points)?;
        let aspect_ratio = bbox.aspect_ratio();
        if aspect_ratio < self.min_aspect_ratio
            || aspect_ratio > self.max_aspect_ratio
            || bbox.area() < self.min_area
        {
            return None;
        }

        let hull = convex_hull(points);
        let hull_area = polygon_area(&hull);
        if hull_area <= 0.0 {
            return None;
        }
        let solidity = contour_area / hull_area;
        if solidity <= self.min_solidity {
            return None;
        }

        Some(PlateCandidate {
            bbox,
            solidity,
            aspect_ratio,
        })
    }
}

/// Smallest upright rectangle covering every point (inclusive pixel extent).
fn bounding_rect(points: &[Point<i32>]) -> Option<BoundingBox> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    let min_x = min_x.max(0) as u32;
    let min_y = min_y.max(0) as u32;
    let max_x = max_x.max(0) as u32;
    let max_y = max_y.max(0) as u32;
    Some(BoundingBox::from_xywh(
        min_x,
        min_y,
        max_x - min_x + 1,
        max_y - min_y + 1,
    ))
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();
    twice.abs() as f64 / 2.0
}
