use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::calibration::{Calibration, Roi};
use crate::error::CounterResult;
use crate::reference::{ReferenceSet, TapId};
use crate::report::{merge_events, EngineReport};
use crate::sampling::{SamplingConfig, SamplingController};
use crate::tap_monitor::{CountingRule, TapMonitor};
use crate::video_source::{FfmpegSource, FrameSource};

/// Tuning for one counting pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub sampling: SamplingConfig,
    pub rule: CountingRule,
    /// Frame rate assumed when the container reports none.
    pub fallback_fps: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            rule: CountingRule::default(),
            fallback_fps: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Frames consumed from the stream, skipped ones included.
    pub frames_processed: u64,
    pub total_frames: u64,
}

impl Progress {
    /// `None` when the stream does not report a frame count.
    pub fn fraction(&self) -> Option<f64> {
        if self.total_frames == 0 {
            return None;
        }
        Some((self.frames_processed as f64 / self.total_frames as f64).min(1.0))
    }
}

#[derive(Debug, Clone)]
enum References {
    /// Loaded from `<dir>/<tap>_<label>.jpg` at the start of every pass.
    Directory(PathBuf),
    Loaded {
        a: Arc<ReferenceSet>,
        b: Arc<ReferenceSet>,
    },
}

/// Runs the classify/count loop over a whole video.
#[derive(Debug, Clone)]
pub struct CountingEngine {
    calibration: Calibration,
    references: References,
    config: EngineConfig,
}

impl CountingEngine {
    pub fn new(calibration: Calibration, refs_dir: impl Into<PathBuf>, config: EngineConfig) -> Self {
        Self {
            calibration,
            references: References::Directory(refs_dir.into()),
            config,
        }
    }

    /// Reads the calibration record up front; references are read per pass.
    pub fn from_files(
        coords_file: impl AsRef<Path>,
        refs_dir: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> CounterResult<Self> {
        let calibration = Calibration::load(coords_file)?;
        Ok(Self::new(calibration, refs_dir, config))
    }

    /// Uses preloaded reference sets, which may be shared between engines.
    pub fn with_references(
        calibration: Calibration,
        tap_a: Arc<ReferenceSet>,
        tap_b: Arc<ReferenceSet>,
        config: EngineConfig,
    ) -> Self {
        Self {
            calibration,
            references: References::Loaded { a: tap_a, b: tap_b },
            config,
        }
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens `path` with FFmpeg and counts it.
    pub fn process_video(
        &self,
        path: impl AsRef<Path>,
        on_progress: impl FnMut(Progress),
    ) -> CounterResult<EngineReport> {
        let path = path.as_ref();
        info!("🎬 [counter] counting pours in {}", path.display());

        let mut source = FfmpegSource::open(path)?;
        let info = source.info();
        if !info.is_indexed() {
            warn!(
                "⚠️  [video] {} reports {} frames at {:.2} fps, timing and progress may be off",
                path.display(),
                info.frame_count,
                info.fps
            );
        }

        self.process_source(&mut source, on_progress)
    }

    /// Counts every frame `source` yields until it runs dry.
    pub fn process_source<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
        mut on_progress: impl FnMut(Progress),
    ) -> CounterResult<EngineReport> {
        let started = Instant::now();
        let info = source.info();

        let fps = if info.fps.is_finite() && info.fps > 0.0 {
            info.fps
        } else {
            let fallback = self.fallback_fps();
            warn!("⚠️  [video] frame rate unavailable, assuming {:.2} fps", fallback);
            fallback
        };

        let (roi_a, roi_b) = self.calibration.scaled_rois(info.width, info.height);
        debug!(
            "[counter] video {}x{}, tap A {:?}, tap B {:?}",
            info.width, info.height, roi_a, roi_b
        );
        let (refs_a, refs_b) = self.references_for(roi_a, roi_b);

        let mut tap_a = TapMonitor::new(TapId::A, roi_a, refs_a, self.config.rule);
        let mut tap_b = TapMonitor::new(TapId::B, roi_b, refs_b, self.config.rule);
        let mut sampler = SamplingController::new(self.config.sampling);

        let mut frame_index: u64 = 0;
        let mut frames_decoded: u64 = 0;
        let mut last_reported: u64 = 0;

        'frames: loop {
            for _ in 0..sampler.frames_to_skip() {
                if !source.grab()? {
                    break 'frames;
                }
                frame_index += 1;
            }

            let frame: GrayImage = match source.read()? {
                Some(frame) => frame,
                None => break,
            };
            frame_index += 1;
            frames_decoded += 1;

            let state_a = tap_a.classify(&frame);
            let state_b = tap_b.classify(&frame);
            sampler.observe(&[state_a, state_b]);

            tap_a.update(state_a, frame_index, fps);
            tap_b.update(state_b, frame_index, fps);

            on_progress(Progress {
                frames_processed: frame_index,
                total_frames: info.frame_count,
            });
            last_reported = frame_index;
        }

        // frames grabbed after the last decode
        if frame_index != last_reported {
            on_progress(Progress {
                frames_processed: frame_index,
                total_frames: info.frame_count,
            });
        }

        for tap in [&tap_a, &tap_b] {
            if let Some(start) = tap.open_pour_start() {
                debug!(
                    "[counter] tap {}: pour open since {:.2}s at end of stream, not counted",
                    tap.tap(),
                    start
                );
            }
        }

        let video_duration = if info.frame_count > 0 {
            info.frame_count as f64 / fps
        } else {
            0.0
        };

        let report = EngineReport {
            count_a: tap_a.beers(),
            count_b: tap_b.beers(),
            seconds_a: tap_a.pouring_seconds(),
            seconds_b: tap_b.pouring_seconds(),
            events: merge_events(tap_a.into_events(), tap_b.into_events()),
            video_duration,
            frames_decoded,
        };

        info!(
            "✅ [counter] done in {:.2}s: A={} B={} total={} ({} of {} frames decoded)",
            started.elapsed().as_secs_f64(),
            report.count_a,
            report.count_b,
            report.total(),
            frames_decoded,
            frame_index
        );
        Ok(report)
    }

    fn fallback_fps(&self) -> f64 {
        let fps = self.config.fallback_fps;
        if fps.is_finite() && fps > 0.0 {
            fps
        } else {
            EngineConfig::default().fallback_fps
        }
    }

    fn references_for(&self, roi_a: Roi, roi_b: Roi) -> (Arc<ReferenceSet>, Arc<ReferenceSet>) {
        match &self.references {
            References::Loaded { a, b } => (Arc::clone(a), Arc::clone(b)),
            References::Directory(dir) => (
                Arc::new(ReferenceSet::load(dir, TapId::A, roi_a.dimensions())),
                Arc::new(ReferenceSet::load(dir, TapId::B, roi_b.dimensions())),
            ),
        }
    }
}
