//! License plate localization and reading.
//!
//! - `locator`: classical candidate proposal, no text
//! - `text`: normalization and grammar validation of OCR output
//! - `pipeline`: OCR-first reading with candidate fallback

mod clahe;
mod locator;
mod pipeline;
mod text;

pub use clahe::Clahe;
pub use locator::{PlateCandidate, PlateCandidateLocator};
pub use pipeline::{estimated_plate_box, PlateReading, PlateTextPipeline, MIN_CROP_SIDE};
pub use text::PlateTextPolicy;
