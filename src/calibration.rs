use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{CounterError, CounterResult};

/// Resolution assumed when a calibration record carries no resolution field.
pub const DEFAULT_REFERENCE_WIDTH: u32 = 1920;
pub const DEFAULT_REFERENCE_HEIGHT: u32 = 1080;

/// Rectangular region of a frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Roi {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Scales each field independently, truncating toward zero.
    pub fn scaled(&self, scale_x: f64, scale_y: f64) -> Self {
        Self {
            x: (self.x as f64 * scale_x) as i32,
            y: (self.y as f64 * scale_y) as i32,
            width: (self.width as f64 * scale_x) as i32,
            height: (self.height as f64 * scale_y) as i32,
        }
    }

    /// Whether the region lies entirely inside a `frame_width` x `frame_height` frame.
    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.width >= 0
            && self.height >= 0
            && self.x as i64 + self.width as i64 <= frame_width as i64
            && self.y as i64 + self.height as i64 <= frame_height as i64
    }

    /// Template dimensions for this region; negative extents collapse to zero.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width.max(0) as u32, self.height.max(0) as u32)
    }
}

/// Tap regions as drawn by the calibration tool, plus the resolution they were drawn at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub roi_a: Roi,
    pub roi_b: Roi,
    pub reference_width: u32,
    pub reference_height: u32,
}

impl Calibration {
    /// Parses a `x,y,w,h|x,y,w,h|W,H` record. The resolution part is optional.
    pub fn parse(record: &str) -> CounterResult<Self> {
        let line = record.trim();
        let malformed = |reason: String| CounterError::Calibration {
            line: line.to_string(),
            reason,
        };

        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(malformed(format!(
                "expected 2 or 3 '|'-separated parts, found {}",
                parts.len()
            )));
        }

        let roi_a = parse_roi(parts[0]).map_err(&malformed)?;
        let roi_b = parse_roi(parts[1]).map_err(&malformed)?;

        let (reference_width, reference_height) = match parts.get(2) {
            Some(part) => {
                let dims = parse_fields(part, 2).map_err(&malformed)?;
                if dims[0] <= 0 || dims[1] <= 0 {
                    return Err(malformed(format!(
                        "reference resolution must be positive, got {}x{}",
                        dims[0], dims[1]
                    )));
                }
                info!("📏 [calibration] reference resolution: {}x{}", dims[0], dims[1]);
                (dims[0] as u32, dims[1] as u32)
            }
            None => {
                warn!(
                    "⚠️  [calibration] no resolution in record, assuming {}x{}",
                    DEFAULT_REFERENCE_WIDTH, DEFAULT_REFERENCE_HEIGHT
                );
                (DEFAULT_REFERENCE_WIDTH, DEFAULT_REFERENCE_HEIGHT)
            }
        };

        Ok(Self {
            roi_a,
            roi_b,
            reference_width,
            reference_height,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> CounterResult<Self> {
        let record = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&record)
    }

    /// Scale factors from the calibration resolution to a video's resolution.
    ///
    /// An unknown (zero) video dimension keeps that axis unscaled.
    pub fn scale_factors(&self, video_width: u32, video_height: u32) -> (f64, f64) {
        let scale_x = if video_width > 0 {
            video_width as f64 / self.reference_width as f64
        } else {
            1.0
        };
        let scale_y = if video_height > 0 {
            video_height as f64 / self.reference_height as f64
        } else {
            1.0
        };
        (scale_x, scale_y)
    }

    pub fn scaled_rois(&self, video_width: u32, video_height: u32) -> (Roi, Roi) {
        let (scale_x, scale_y) = self.scale_factors(video_width, video_height);
        (
            self.roi_a.scaled(scale_x, scale_y),
            self.roi_b.scaled(scale_x, scale_y),
        )
    }
}

fn parse_roi(part: &str) -> Result<Roi, String> {
    let fields = parse_fields(part, 4)?;
    Ok(Roi::new(fields[0], fields[1], fields[2], fields[3]))
}

fn parse_fields(part: &str, expected: usize) -> Result<Vec<i32>, String> {
    let fields = part
        .split(',')
        .map(|field| {
            let field = field.trim();
            field
                .parse::<i32>()
                .map_err(|e| format!("invalid integer {:?}: {}", field, e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if fields.len() != expected {
        return Err(format!(
            "expected {} comma-separated fields in {:?}, found {}",
            expected,
            part,
            fields.len()
        ));
    }
    Ok(fields)
}
