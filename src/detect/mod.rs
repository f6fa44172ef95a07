//! External capabilities used by the detection pipeline.
//!
//! - `ObjectDetector`: frame in, class-id/confidence/box triples out
//! - `OcrEngine`: image region in, text spans out
//!
//! Backends are picked by name from configuration.

mod backend;
mod backends;
mod result;
pub(crate) mod yolo;

use anyhow::{anyhow, Result};

use crate::config::{DetectorSettings, OcrSettings};

pub use backend::{ObjectDetector, OcrEngine, OcrSpan, RawDetection};
pub use backends::{StubDetector, StubOcr, TesseractOcr};
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use result::{Detection, DetectionKind, VehicleClass};

/// Build the configured object detector and run its warm-up hook.
pub fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn ObjectDetector>> {
    let mut detector: Box<dyn ObjectDetector> = match settings.backend.as_str() {
        "stub" => Box::new(StubDetector::empty()),
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("detector backend 'tract' requires a model_path"))?;
            Box::new(TractDetector::new(model_path, settings.input_size)?)
        }
        #[cfg(not(feature = "backend-tract"))]
        "tract" => {
            return Err(anyhow!(
                "detector backend 'tract' requires the backend-tract feature"
            ))
        }
        other => return Err(anyhow!("unknown detector backend '{}'", other)),
    };
    detector.warm_up()?;
    log::info!("object detector: {}", detector.name());
    Ok(detector)
}

/// Build the configured OCR engine, or `None` when OCR is disabled.
pub fn build_ocr(settings: &OcrSettings) -> Result<Option<Box<dyn OcrEngine>>> {
    if !settings.enabled {
        log::info!("OCR disabled; plates will not be read");
        return Ok(None);
    }
    let engine: Box<dyn OcrEngine> = match settings.engine.as_str() {
        "tesseract" => Box::new(TesseractOcr::new(
            settings.tesseract_path.clone(),
            settings.language.clone(),
        )),
        "stub" => Box::new(StubOcr::silent()),
        other => return Err(anyhow!("unknown OCR engine '{}'", other)),
    };
    log::info!("OCR engine: {}", engine.name());
    Ok(Some(engine))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_named_backends() -> Result<()> {
        let detector = build_detector(&DetectorSettings {
            backend: "stub".into(),
            ..DetectorSettings::default()
        })?;
        assert_eq!(detector.name(), "stub");

        let ocr = build_ocr(&OcrSettings {
            enabled: true,
            engine: "tesseract".into(),
            ..OcrSettings::default()
        })?;
        assert_eq!(ocr.map(|engine| engine.name()), Some("tesseract"));
        Ok(())
    }

    #[test]
    fn disabled_ocr_builds_nothing() -> Result<()> {
        let ocr = build_ocr(&OcrSettings {
            enabled: false,
            ..OcrSettings::default()
        })?;
        assert!(ocr.is_none());
        Ok(())
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(build_detector(&DetectorSettings {
            backend: "cuda-magic".into(),
            ..DetectorSettings::default()
        })
        .is_err());
    }
}
