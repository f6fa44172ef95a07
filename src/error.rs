use thiserror::Error;

/// Failure to bring a frame source up.
///
/// Fatal to `FrameSource::start`, recoverable by retrying with backoff.
/// A running session never surfaces this from `read()`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no frame from {source_name} after {attempts} attempts")]
    NoFrame { source_name: String, attempts: u32 },

    #[error("invalid source descriptor '{0}'")]
    InvalidSource(String),

    #[error("unsupported source: {0}")]
    Unsupported(String),

    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
}

/// Failure of the external object detector on one frame.
///
/// The frame is dropped from detection; acquisition keeps running.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("object detector '{backend}' failed: {reason:#}")]
    Detector {
        backend: &'static str,
        reason: anyhow::Error,
    },
}
