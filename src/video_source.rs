use ffmpeg_next as ffmpeg;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{CounterError, CounterResult};

/// Container metadata. Any field is 0 when the container does not say.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoInfo {
    pub fps: f64,
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
}

impl VideoInfo {
    /// Both frame count and frame rate are known. Streams without an index
    /// report neither and need to be remuxed before timing can be trusted.
    pub fn is_indexed(&self) -> bool {
        self.frame_count > 0 && self.fps > 0.0
    }
}

/// Sequential frame access used by the counting loop.
pub trait FrameSource {
    fn info(&self) -> VideoInfo;

    /// Moves past the next frame without converting it. `false` at end of stream.
    fn grab(&mut self) -> CounterResult<bool>;

    /// Next frame as 8-bit grayscale, `None` at end of stream.
    fn read(&mut self) -> CounterResult<Option<GrayImage>>;
}

/// Decodes a video file with FFmpeg.
pub struct FfmpegSource {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    stream_index: usize,
    info: VideoInfo,
    eof_sent: bool,
}

impl FfmpegSource {
    pub fn open(path: impl AsRef<Path>) -> CounterResult<Self> {
        let path = path.as_ref();
        init_ffmpeg()?;

        let input = ffmpeg::format::input(&path).map_err(|e| CounterError::VideoOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let (stream_index, decoder, info) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or(CounterError::NoVideoStream)?;

            let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
            let decoder = context.decoder().video()?;

            let fps = [stream.avg_frame_rate(), stream.rate()]
                .into_iter()
                .find(|r| r.numerator() > 0 && r.denominator() > 0)
                .map(|r| r.numerator() as f64 / r.denominator() as f64)
                .unwrap_or(0.0);

            let frame_count = if stream.frames() > 0 {
                stream.frames() as u64
            } else if input.duration() > 0 && fps > 0.0 {
                // no frame index, estimate from the container duration
                let seconds = input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
                (seconds * fps).round() as u64
            } else {
                0
            };

            let info = VideoInfo {
                fps,
                frame_count,
                width: decoder.width(),
                height: decoder.height(),
            };
            (stream.index(), decoder, info)
        };

        debug!("[video] opened {}: {:?}", path.display(), info);
        Ok(Self {
            input,
            decoder,
            scaler: None,
            stream_index,
            info,
            eof_sent: false,
        })
    }

    /// Pulls the next decoded frame, feeding packets as the decoder asks for them.
    fn next_decoded(&mut self, frame: &mut ffmpeg::frame::Video) -> CounterResult<bool> {
        loop {
            if self.decoder.receive_frame(frame).is_ok() {
                return Ok(true);
            }
            if self.eof_sent {
                return Ok(false);
            }

            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        // a damaged packet only costs its own frames
                        debug!("[video] packet rejected by decoder: {}", e);
                    }
                }
                None => {
                    self.decoder.send_eof()?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn to_gray(&mut self, frame: &ffmpeg::frame::Video) -> CounterResult<GrayImage> {
        let (width, height, format) = (frame.width(), frame.height(), frame.format());

        let stale = self.scaler.as_ref().map_or(true, |s| {
            s.input().width != width || s.input().height != height || s.input().format != format
        });
        if stale {
            self.scaler = Some(ffmpeg::software::scaling::Context::get(
                format,
                width,
                height,
                ffmpeg::format::Pixel::GRAY8,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )?);
        }

        let mut gray = ffmpeg::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(frame, &mut gray)?;
        }
        frame_to_gray_image(&gray)
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn grab(&mut self) -> CounterResult<bool> {
        let mut frame = ffmpeg::frame::Video::empty();
        self.next_decoded(&mut frame)
    }

    fn read(&mut self) -> CounterResult<Option<GrayImage>> {
        let mut frame = ffmpeg::frame::Video::empty();
        if !self.next_decoded(&mut frame)? {
            return Ok(None);
        }
        self.to_gray(&frame).map(Some)
    }
}

/// Copies the luma plane of a GRAY8 frame, dropping row padding.
fn frame_to_gray_image(frame: &ffmpeg::frame::Video) -> CounterResult<GrayImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride < width || data.len() < stride * height.saturating_sub(1) + width {
        return Err(CounterError::Decode(format!(
            "gray plane too small: {} bytes, stride {}, {}x{}",
            data.len(),
            stride,
            width,
            height
        )));
    }

    let mut pixels = Vec::with_capacity(width * height);
    for row in 0..height {
        let start = row * stride;
        pixels.extend_from_slice(&data[start..start + width]);
    }

    GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| CounterError::Decode("gray buffer size mismatch".to_string()))
}

fn init_ffmpeg() -> CounterResult<()> {
    ffmpeg::init()?;
    // FFmpeg is chatty about recoverable stream damage
    ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    Ok(())
}

/// Result of a quick look at a video's container metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoHealth {
    pub info: VideoInfo,
    /// Opens and reports both a frame count and a frame rate.
    pub healthy: bool,
}

pub fn probe_video(path: impl AsRef<Path>) -> CounterResult<VideoHealth> {
    let path = path.as_ref();
    let info = FfmpegSource::open(path)?.info();
    let healthy = info.is_indexed();

    if healthy {
        info!(
            "✅ [video] {} looks healthy ({} frames, {:.2} fps)",
            path.display(),
            info.frame_count,
            info.fps
        );
    } else {
        warn!(
            "⚠️  [video] {} has no index (frames: {}, fps: {:.2}), consider remuxing it",
            path.display(),
            info.frame_count,
            info.fps
        );
    }
    Ok(VideoHealth { info, healthy })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexed_needs_count_and_rate() {
        let mut info = VideoInfo {
            fps: 25.0,
            frame_count: 100,
            width: 640,
            height: 480,
        };
        assert!(info.is_indexed());
        info.frame_count = 0;
        assert!(!info.is_indexed());
        info.frame_count = 100;
        info.fps = 0.0;
        assert!(!info.is_indexed());
    }

    #[test]
    fn test_missing_file_is_an_open_error() {
        let missing = std::env::temp_dir()
            .join(uuid::Uuid::new_v4().to_string())
            .join("missing.mp4");
        let err = FfmpegSource::open(&missing).err().unwrap();
        assert!(matches!(err, CounterError::VideoOpen { .. }), "{:?}", err);
    }
}
