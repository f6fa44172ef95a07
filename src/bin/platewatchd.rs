//! platewatchd - live camera plate watcher
//!
//! This daemon:
//! 1. Opens the configured camera source (RTSP, HTTP snapshot, local device)
//! 2. Runs person/vehicle detection on every new frame
//! 3. Reads the plate of each detected vehicle
//! 4. Writes detection records (JSON lines and/or log)
//! 5. Reconnects the camera with backoff while keeping the last frame

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use plate_watch::detect::{build_detector, build_ocr};
use plate_watch::sink::{JsonLinesSink, LogSink};
use plate_watch::{
    open_source, DetectionOrchestrator, PlateTextPipeline, PlateTextPolicy, PlateWatchConfig,
    Session,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Live camera person/vehicle detection with plate reading")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "PLATEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// JSON-lines file for detection records (overrides the config).
    #[arg(long)]
    records: Option<PathBuf>,

    /// Disable plate reading.
    #[arg(long)]
    no_ocr: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PlateWatchConfig::load_from(args.config.as_deref())?;
    if let Some(records) = args.records {
        cfg.output.records_path = Some(records);
    }
    if args.no_ocr {
        cfg.ocr.enabled = false;
    }

    let detector = build_detector(&cfg.detector)?;
    let ocr = build_ocr(&cfg.ocr)?;
    let policy = PlateTextPolicy {
        correct_confusables: cfg.ocr.correct_confusables,
        ..PlateTextPolicy::default()
    };
    let plates = PlateTextPipeline::new(ocr).with_policy(policy);
    let orchestrator = DetectionOrchestrator::new(detector, plates, cfg.detection.clone());

    let source = open_source(&cfg.camera)?;
    let mut session = Session::new(source, orchestrator)
        .with_stale_after(cfg.camera.stale_after)
        .with_detection_sink(Box::new(LogSink));
    if let Some(path) = &cfg.output.records_path {
        session = session.with_detection_sink(Box::new(JsonLinesSink::open(path)?));
        log::info!("writing detection records to {}", path.display());
    }

    if let Err(e) = session.start() {
        log::error!("camera start failed: {}", e);
        return Err(anyhow!(e));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    log::info!(
        "platewatchd running: {}x{} @ {} fps, ocr={}",
        cfg.camera.width,
        cfg.camera.height,
        cfg.camera.fps,
        cfg.ocr.enabled
    );
    session.run(&shutdown)?;

    let stats = session.stats();
    log::info!(
        "platewatchd stopped: persons={} vehicles={} plates={}",
        stats.total_persons,
        stats.total_vehicles,
        stats.total_plates
    );
    Ok(())
}
