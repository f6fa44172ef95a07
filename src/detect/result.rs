use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::plate::PlateReading;
use crate::BoundingBox;

/// Semantic category of an accepted detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    Person,
    Vehicle,
}

impl DetectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Vehicle => "vehicle",
        }
    }
}

/// Vehicle subtype from the class-id label table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Bicycle,
    Car,
    Motorcycle,
    Bus,
    Truck,
    Other,
}

impl VehicleClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bicycle => "bicycle",
            Self::Car => "car",
            Self::Motorcycle => "motorcycle",
            Self::Bus => "bus",
            Self::Truck => "truck",
            Self::Other => "other",
        }
    }

    /// COCO class ids for vehicle subtypes.
    pub fn coco_labels() -> BTreeMap<u32, VehicleClass> {
        BTreeMap::from([
            (1, Self::Bicycle),
            (2, Self::Car),
            (3, Self::Motorcycle),
            (5, Self::Bus),
            (7, Self::Truck),
        ])
    }
}

/// Accepted person or vehicle detection for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub kind: DetectionKind,
    /// Frame-space box.
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Set for vehicles only.
    pub vehicle_class: Option<VehicleClass>,
    /// Plate read from this vehicle, box in frame space.
    pub plate: Option<PlateReading>,
}

impl Detection {
    pub fn person(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            kind: DetectionKind::Person,
            bbox,
            confidence,
            vehicle_class: None,
            plate: None,
        }
    }

    pub fn vehicle(bbox: BoundingBox, confidence: f32, class: VehicleClass) -> Self {
        Self {
            kind: DetectionKind::Vehicle,
            bbox,
            confidence,
            vehicle_class: Some(class),
            plate: None,
        }
    }
}
