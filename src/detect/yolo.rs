//! Decoding of YOLOv8-style detection heads.
//!
//! The head output is a `(1, 4 + C, N)` tensor: for each of `N` anchors, a
//! center/size box in model-input pixels followed by `C` class scores.

use crate::detect::backend::RawDetection;
use crate::BoundingBox;

/// Letterbox-free scaling from model input to frame pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct InputScale {
    pub(crate) input_size: u32,
    pub(crate) frame_width: u32,
    pub(crate) frame_height: u32,
}

/// Decode a row-major `(4 + classes) x anchors` buffer into frame-space boxes,
/// keeping the best class per anchor at or above `min_confidence`.
pub(crate) fn decode_head(
    data: &[f32],
    classes: usize,
    anchors: usize,
    scale: InputScale,
    min_confidence: f32,
) -> Vec<RawDetection> {
    let rows = 4 + classes;
    if classes == 0 || data.len() < rows * anchors {
        return Vec::new();
    }
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];
    let sx = scale.frame_width as f32 / scale.input_size.max(1) as f32;
    let sy = scale.frame_height as f32 / scale.input_size.max(1) as f32;

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let (class_id, score) = (0..classes)
            .map(|class| (class, at(4 + class, anchor)))
            .fold((0usize, f32::NEG_INFINITY), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });
        if !score.is_finite() || score < min_confidence {
            continue;
        }

        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        let bbox = BoundingBox::from_f32_clamped(
            (cx - w / 2.0) * sx,
            (cy - h / 2.0) * sy,
            (cx + w / 2.0) * sx,
            (cy + h / 2.0) * sy,
            scale.frame_width,
            scale.frame_height,
        );
        if bbox.is_empty() {
            continue;
        }
        detections.push(RawDetection::new(class_id as u32, score.min(1.0), bbox));
    }
    detections
}

/// Per-class greedy non-maximum suppression. Output is ordered by confidence.
pub(crate) fn non_max_suppression(
    mut detections: Vec<RawDetection>,
    iou_threshold: f32,
) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RawDetection> = Vec::new();
    for candidate in detections {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) >= iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(anchors: &[[f32; 6]]) -> Vec<f32> {
        let mut data = vec![0.0; 6 * anchors.len()];
        for (i, anchor) in anchors.iter().enumerate() {
            for (row, value) in anchor.iter().enumerate() {
                data[row * anchors.len() + i] = *value;
            }
        }
        data
    }

    #[test]
    fn decodes_best_class_and_scales_to_frame() {
        let data = head(&[
            [320.0, 320.0, 64.0, 32.0, 0.1, 0.9],
            [100.0, 100.0, 10.0, 10.0, 0.2, 0.1],
        ]);
        let scale = InputScale {
            input_size: 640,
            frame_width: 1280,
            frame_height: 640,
        };

        let detections = decode_head(&data, 2, 2, scale, 0.5);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 1);
        assert_eq!(detections[0].bbox, BoundingBox::new(576, 304, 704, 336));
    }

    #[test]
    fn suppression_is_per_class() {
        let a = RawDetection::new(2, 0.9, BoundingBox::new(0, 0, 100, 100));
        let b = RawDetection::new(2, 0.8, BoundingBox::new(5, 5, 100, 100));
        let c = RawDetection::new(0, 0.7, BoundingBox::new(5, 5, 100, 100));

        let kept = non_max_suppression(vec![b, c, a], 0.45);
        assert_eq!(kept, vec![a, c]);
    }
}
