use ffmpeg_next as ffmpeg;
use thiserror::Error;

/// Errors surfaced by the counting engine.
///
/// Soft failures (missing reference images, out-of-frame ROIs) never show up
/// here; they degrade in place and are logged.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed calibration record {line:?}: {reason}")]
    Calibration { line: String, reason: String },
    #[error("cannot open video {path}: {reason}")]
    VideoOpen { path: String, reason: String },
    #[error("no video stream found")]
    NoVideoStream,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg::Error),
}

pub type CounterResult<T> = Result<T, CounterError>;
