pub mod calibration;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod reference;
pub mod report;
pub mod sampling;
pub mod tap_monitor;
pub mod video_source;

pub use calibration::{Calibration, Roi};
pub use config::{ConfigLoader, ConfigOverrides, CounterConfig};
pub use engine::{CountingEngine, EngineConfig, Progress};
pub use error::{CounterError, CounterResult};
pub use reference::{ReferenceSet, TapId, TapState};
pub use report::{EngineReport, ReportSummary};
pub use sampling::{SamplingConfig, SamplingController};
pub use tap_monitor::{beers_for_duration, CountingRule, PourEvent, TapMonitor};
pub use video_source::{probe_video, FfmpegSource, FrameSource, VideoHealth, VideoInfo};
