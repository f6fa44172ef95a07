use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use plate_watch::config::CameraSettings;
use plate_watch::sink::{MemorySink, PreviewSink};
use plate_watch::{
    open_source, BoundingBox, DetectionKind, DetectionOrchestrator, DetectionSettings, Frame,
    FrameBuffer, PlateTextPipeline, RawDetection, Session, StubDetector, StubOcr, VehicleClass,
};

fn car_detector(bbox: BoundingBox) -> StubDetector {
    StubDetector::fixed(vec![
        RawDetection::new(2, 0.92, bbox),
        RawDetection::new(0, 0.30, BoundingBox::new(0, 0, 10, 30)),
    ])
}

#[test]
fn synthetic_camera_to_records() -> anyhow::Result<()> {
    let source = open_source(&CameraSettings {
        source: "stub://e2e".into(),
        width: 320,
        height: 240,
        fps: 30,
        ..CameraSettings::default()
    })?;
    let car = BoundingBox::new(60, 80, 260, 220);
    let orchestrator = DetectionOrchestrator::new(
        Box::new(car_detector(car)),
        PlateTextPipeline::new(Some(Box::new(StubOcr::reading("29A-123.45", 0.9)))),
        DetectionSettings::default(),
    );
    let records = MemorySink::new();
    let preview = FrameBuffer::new();
    let mut session = Session::new(source, orchestrator)
        .with_detection_sink(Box::new(records.clone()))
        .with_snapshot_sink(Box::new(PreviewSink::new(preview.clone())));
    session.start()?;

    let deadline = Instant::now() + Duration::from_secs(5);
    let detections = loop {
        if let Some(detections) = session.step()? {
            break detections;
        }
        assert!(Instant::now() < deadline, "no frame processed");
        std::thread::sleep(Duration::from_millis(5));
    };
    session.release();

    // The low-confidence person is filtered out.
    assert_eq!(detections.detections.len(), 1);
    let vehicle = &detections.detections[0];
    assert_eq!(vehicle.kind, DetectionKind::Vehicle);
    assert_eq!(vehicle.vehicle_class, Some(VehicleClass::Car));

    assert_eq!(detections.plates.len(), 1);
    let plate = &detections.plates[0];
    assert_eq!(plate.vehicle_box, vehicle.bbox);
    assert_eq!(plate.reading.text, "29A-123.45");
    assert!(plate.reading.confidence == 0.85 || plate.reading.confidence == 0.75);
    let region = car.expand(0.10, 320, 240);
    let plate_box = plate.reading.bbox.expect("plate box");
    assert!(plate_box.x1 >= region.x1 && plate_box.x2 <= region.x2);
    assert!(plate_box.y1 >= region.y1 && plate_box.y2 <= region.y2);

    let stored = records.records();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].plate_text.as_deref(), Some("29A-123.45"));
    assert_eq!(stored[0].vehicle_type, Some(VehicleClass::Car));
    assert!(preview.get().is_some());
    assert_eq!(session.stats().total_plates, 1);
    Ok(())
}

#[test]
fn located_plate_is_reported_in_frame_space() -> anyhow::Result<()> {
    let mut image = RgbImage::from_pixel(640, 480, Rgb([25, 25, 25]));
    draw_filled_rect_mut(
        &mut image,
        Rect::at(300, 330).of_size(120, 40),
        Rgb([240, 240, 240]),
    );
    let frame = Frame::new(image);
    let car = BoundingBox::new(240, 200, 480, 400);

    let mut orchestrator = DetectionOrchestrator::new(
        Box::new(car_detector(car)),
        PlateTextPipeline::new(Some(Box::new(StubOcr::reading("29A12345", 0.9)))),
        DetectionSettings::default(),
    );
    let result = orchestrator.process(&frame)?;

    assert_eq!(result.vehicles().count(), 1);
    assert_eq!(result.plates.len(), 1);
    let reading = &result.plates[0].reading;
    assert_eq!(reading.confidence, 0.85);
    assert_eq!(result.detections[0].plate.as_ref(), Some(reading));

    // The painted plate spans (300, 330)-(420, 370) in the frame.
    let b = reading.bbox.expect("plate box");
    assert!(b.x1 >= 295 && b.x1 <= 305, "{:?}", b);
    assert!(b.y1 >= 325 && b.y1 <= 335, "{:?}", b);
    assert!(b.x2 >= 415 && b.x2 <= 425, "{:?}", b);
    assert!(b.y2 >= 365 && b.y2 <= 375, "{:?}", b);
    Ok(())
}

#[test]
fn ocr_disabled_still_counts_vehicles() -> anyhow::Result<()> {
    let frame = Frame::new(RgbImage::from_pixel(320, 240, Rgb([90, 90, 90])));
    let mut orchestrator = DetectionOrchestrator::new(
        Box::new(car_detector(BoundingBox::new(10, 10, 200, 200))),
        PlateTextPipeline::new(None),
        DetectionSettings::default(),
    );

    let result = orchestrator.process(&frame)?;
    assert_eq!(result.vehicles().count(), 1);
    assert!(result.plates.is_empty());
    assert_eq!(orchestrator.stats().total_vehicles, 1);
    assert_eq!(orchestrator.stats().total_plates, 0);
    Ok(())
}
