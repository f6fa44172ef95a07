pub mod stub;
pub mod tesseract;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubDetector, StubOcr};
pub use tesseract::TesseractOcr;

#[cfg(feature = "backend-tract")]
pub use tract::TractDetector;
