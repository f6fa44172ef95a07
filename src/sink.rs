//! Outputs of a detection pass.
//!
//! - `DetectionSink`: persistence of per-detection records
//! - `SnapshotSink`: the rendered frame (with overlays) plus a save flag
//!
//! Storage layout and schema beyond the record fields belong to the sink.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;

use crate::detect::{Detection, DetectionKind, VehicleClass};
use crate::frame::{Frame, FrameBuffer};
use crate::orchestrator::FrameDetections;
use crate::BoundingBox;

pub const PERSON_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const VEHICLE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const PLATE_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

/// Serialized projection of one accepted detection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    #[serde(rename = "type")]
    pub kind: DetectionKind,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Milliseconds since the Unix epoch at capture.
    pub captured_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<VehicleClass>,
}

impl DetectionRecord {
    pub fn from_detection(
        detection: &Detection,
        captured_at: SystemTime,
        snapshot_path: Option<&str>,
    ) -> Self {
        let captured_at_ms = captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            kind: detection.kind,
            confidence: detection.confidence,
            bbox: detection.bbox,
            captured_at_ms,
            snapshot_path: snapshot_path.map(str::to_string),
            plate_text: detection.plate.as_ref().map(|p| p.text.clone()),
            vehicle_type: detection.vehicle_class,
        }
    }
}

/// Persistence capability for detection records.
pub trait DetectionSink: Send {
    fn name(&self) -> &'static str;

    /// Persist the records of one frame.
    fn write(&mut self, records: &[DetectionRecord]) -> Result<()>;
}

/// Appends one JSON object per record to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open records file {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DetectionSink for JsonLinesSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn write(&mut self, records: &[DetectionRecord]) -> Result<()> {
        for record in records {
            serde_json::to_writer(&mut self.writer, record)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}

/// Logs every record at info level.
#[derive(Default)]
pub struct LogSink;

impl DetectionSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn write(&mut self, records: &[DetectionRecord]) -> Result<()> {
        for record in records {
            let b = record.bbox;
            match (&record.vehicle_type, &record.plate_text) {
                (Some(vehicle), Some(plate)) => log::info!(
                    "detection: {} {} conf={:.2} box=({},{},{},{}) plate={}",
                    record.kind.as_str(),
                    vehicle.as_str(),
                    record.confidence,
                    b.x1,
                    b.y1,
                    b.x2,
                    b.y2,
                    plate
                ),
                (Some(vehicle), None) => log::info!(
                    "detection: {} {} conf={:.2} box=({},{},{},{})",
                    record.kind.as_str(),
                    vehicle.as_str(),
                    record.confidence,
                    b.x1,
                    b.y1,
                    b.x2,
                    b.y2
                ),
                _ => log::info!(
                    "detection: {} conf={:.2} box=({},{},{},{})",
                    record.kind.as_str(),
                    record.confidence,
                    b.x1,
                    b.y1,
                    b.x2,
                    b.y2
                ),
            }
        }
        Ok(())
    }
}

/// Keeps records in memory. Cloning shares the store.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<DetectionRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DetectionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DetectionSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&mut self, records: &[DetectionRecord]) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(records);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Snapshots
// ----------------------------------------------------------------------------

/// Receives the rendered frame of every processed pass.
pub trait SnapshotSink: Send {
    /// `save` is set when the frame carried persons or vehicles. Returns the
    /// stored snapshot's path when the sink kept one.
    fn submit(&mut self, rendered: &Frame, save: bool) -> Result<Option<String>>;
}

/// Publishes rendered frames into a `FrameBuffer` for live preview.
#[derive(Clone, Default)]
pub struct PreviewSink {
    buffer: FrameBuffer,
}

impl PreviewSink {
    pub fn new(buffer: FrameBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }
}

impl SnapshotSink for PreviewSink {
    fn submit(&mut self, rendered: &Frame, _save: bool) -> Result<Option<String>> {
        self.buffer.set(rendered.clone());
        Ok(None)
    }
}

/// Copy of `frame` with detection boxes drawn on it.
pub fn render_overlays(frame: &Frame, detections: &FrameDetections) -> Frame {
    let mut rendered = frame.clone();
    for detection in &detections.detections {
        let color = match detection.kind {
            DetectionKind::Person => PERSON_COLOR,
            DetectionKind::Vehicle => VEHICLE_COLOR,
        };
        draw_box(&mut rendered, &detection.bbox, color);
    }
    for plate in &detections.plates {
        if let Some(bbox) = &plate.reading.bbox {
            draw_box(&mut rendered, bbox, PLATE_COLOR);
        }
    }
    rendered
}

fn draw_box(frame: &mut Frame, bbox: &BoundingBox, color: Rgb<u8>) {
    let bbox = bbox.clamp_to(frame.width(), frame.height());
    if bbox.is_empty() {
        return;
    }
    let rect = Rect::at(bbox.x1 as i32, bbox.y1 as i32).of_size(bbox.width(), bbox.height());
    draw_hollow_rect_mut(frame.image_mut(), rect, color);
}
