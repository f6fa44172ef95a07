use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::VehicleClass;
use crate::ingest::{HttpAuthScheme, SourceDescriptor};
use crate::orchestrator::{
    DetectionSettings, DEFAULT_EXPAND_RATIO, DEFAULT_PERSON_CLASSES, DEFAULT_PERSON_THRESHOLD,
    DEFAULT_VEHICLE_CLASSES, DEFAULT_VEHICLE_THRESHOLD,
};

const DEFAULT_SOURCE: &str = "stub://front_camera";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 10;
const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
const DEFAULT_STALE_AFTER_SECS: u64 = 10;
const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_OCR_ENGINE: &str = "tesseract";
const DEFAULT_TESSERACT_PATH: &str = "tesseract";
const DEFAULT_OCR_LANGUAGE: &str = "eng";

#[derive(Debug, Deserialize, Default)]
struct PlateWatchConfigFile {
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
    ocr: Option<OcrConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    username: Option<String>,
    password: Option<String>,
    auth: Option<HttpAuthScheme>,
    ffmpeg_path: Option<String>,
    stale_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    person_threshold: Option<f32>,
    vehicle_threshold: Option<f32>,
    person_classes: Option<Vec<u32>>,
    vehicle_classes: Option<Vec<u32>>,
    /// Class id (as a string key) to vehicle subtype.
    vehicle_labels: Option<BTreeMap<String, VehicleClass>>,
    expand_ratio: Option<f64>,
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct OcrConfigFile {
    enabled: Option<bool>,
    engine: Option<String>,
    tesseract_path: Option<String>,
    language: Option<String>,
    correct_confusables: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    records_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct PlateWatchConfig {
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
    pub detector: DetectorSettings,
    pub ocr: OcrSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    /// `rtsp://...`, `http(s)://...`, `/dev/videoN`, a device index, or
    /// `stub://name`.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    /// HTTP snapshot sources only.
    pub auth: HttpAuthScheme,
    pub ffmpeg_path: String,
    /// Restart the source when no frame arrived for this long.
    pub stale_after: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            username: None,
            password: None,
            auth: HttpAuthScheme::default(),
            ffmpeg_path: DEFAULT_FFMPEG_PATH.to_string(),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// `stub` or `tract`.
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            model_path: None,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrSettings {
    pub enabled: bool,
    /// `tesseract` or `stub`.
    pub engine: String,
    pub tesseract_path: String,
    pub language: String,
    pub correct_confusables: bool,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            engine: DEFAULT_OCR_ENGINE.to_string(),
            tesseract_path: DEFAULT_TESSERACT_PATH.to_string(),
            language: DEFAULT_OCR_LANGUAGE.to_string(),
            correct_confusables: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSettings {
    /// JSON-lines detection records; records are only logged when unset.
    pub records_path: Option<PathBuf>,
}

impl PlateWatchConfig {
    /// Load from the file named by `PLATEWATCH_CONFIG` (if any), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PLATEWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PlateWatchConfigFile) -> Result<Self> {
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            source: camera_file
                .source
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            width: camera_file.width.unwrap_or(DEFAULT_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_HEIGHT),
            fps: camera_file.fps.unwrap_or(DEFAULT_FPS),
            username: camera_file.username,
            password: camera_file.password,
            auth: camera_file.auth.unwrap_or_default(),
            ffmpeg_path: camera_file
                .ffmpeg_path
                .unwrap_or_else(|| DEFAULT_FFMPEG_PATH.to_string()),
            stale_after: Duration::from_secs(
                camera_file
                    .stale_after_secs
                    .unwrap_or(DEFAULT_STALE_AFTER_SECS),
            ),
        };

        let detection_file = file.detection.unwrap_or_default();
        let vehicle_labels = match detection_file.vehicle_labels {
            Some(labels) => parse_labels(labels)?,
            None => VehicleClass::coco_labels(),
        };
        let detection = DetectionSettings {
            person_threshold: detection_file
                .person_threshold
                .unwrap_or(DEFAULT_PERSON_THRESHOLD),
            vehicle_threshold: detection_file
                .vehicle_threshold
                .unwrap_or(DEFAULT_VEHICLE_THRESHOLD),
            person_classes: detection_file
                .person_classes
                .map(|ids| ids.into_iter().collect())
                .unwrap_or_else(|| DEFAULT_PERSON_CLASSES.into_iter().collect()),
            vehicle_classes: detection_file
                .vehicle_classes
                .map(|ids| ids.into_iter().collect())
                .unwrap_or_else(|| DEFAULT_VEHICLE_CLASSES.into_iter().collect()),
            vehicle_labels,
            expand_ratio: detection_file.expand_ratio.unwrap_or(DEFAULT_EXPAND_RATIO),
        };
        let detector = DetectorSettings {
            backend: detection_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            model_path: detection_file.model_path,
            input_size: detection_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
        };

        let ocr_file = file.ocr.unwrap_or_default();
        let ocr = OcrSettings {
            enabled: ocr_file.enabled.unwrap_or(true),
            engine: ocr_file
                .engine
                .unwrap_or_else(|| DEFAULT_OCR_ENGINE.to_string()),
            tesseract_path: ocr_file
                .tesseract_path
                .unwrap_or_else(|| DEFAULT_TESSERACT_PATH.to_string()),
            language: ocr_file
                .language
                .unwrap_or_else(|| DEFAULT_OCR_LANGUAGE.to_string()),
            correct_confusables: ocr_file.correct_confusables.unwrap_or(true),
        };

        let output = OutputSettings {
            records_path: file.output.and_then(|output| output.records_path),
        };

        Ok(Self {
            camera,
            detection,
            detector,
            ocr,
            output,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = non_empty_env("PLATEWATCH_SOURCE") {
            self.camera.source = source;
        }
        if let Some(username) = non_empty_env("PLATEWATCH_CAMERA_USERNAME") {
            self.camera.username = Some(username);
        }
        if let Some(password) = non_empty_env("PLATEWATCH_CAMERA_PASSWORD") {
            self.camera.password = Some(password);
        }
        if let Some(enabled) = non_empty_env("PLATEWATCH_OCR_ENABLED") {
            self.ocr.enabled = parse_flag(&enabled).ok_or_else(|| {
                anyhow!("PLATEWATCH_OCR_ENABLED must be one of true/false/1/0/yes/no/on/off")
            })?;
        }
        if let Some(engine) = non_empty_env("PLATEWATCH_OCR_ENGINE") {
            self.ocr.engine = engine;
        }
        if let Some(backend) = non_empty_env("PLATEWATCH_DETECTOR_BACKEND") {
            self.detector.backend = backend;
        }
        if let Some(path) = non_empty_env("PLATEWATCH_RECORDS_PATH") {
            self.output.records_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        SourceDescriptor::parse(&self.camera.source)
            .map_err(|e| anyhow!("camera.source: {}", e))?;
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.camera.fps == 0 {
            return Err(anyhow!("camera fps must be greater than zero"));
        }
        if self.camera.stale_after.is_zero() {
            return Err(anyhow!("camera stale_after_secs must be greater than zero"));
        }

        let detection = &self.detection;
        for (name, value) in [
            ("person_threshold", detection.person_threshold),
            ("vehicle_threshold", detection.vehicle_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("detection.{} must be within [0, 1]", name));
            }
        }
        if !(0.0..1.0).contains(&detection.expand_ratio) {
            return Err(anyhow!("detection.expand_ratio must be within [0, 1)"));
        }
        let overlap: BTreeSet<_> = detection
            .person_classes
            .intersection(&detection.vehicle_classes)
            .collect();
        if !overlap.is_empty() {
            return Err(anyhow!(
                "class ids {:?} are both person and vehicle classes",
                overlap
            ));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detection.input_size must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PlateWatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_labels(labels: BTreeMap<String, VehicleClass>) -> Result<BTreeMap<u32, VehicleClass>> {
    labels
        .into_iter()
        .map(|(id, class)| {
            id.trim()
                .parse::<u32>()
                .map(|id| (id, class))
                .map_err(|_| anyhow!("detection.vehicle_labels key '{}' is not a class id", id))
        })
        .collect()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
