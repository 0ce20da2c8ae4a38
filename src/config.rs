use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::engine::EngineConfig;
use crate::sampling::SamplingConfig;
use crate::tap_monitor::CountingRule;

const INI_SECTION: &str = "pour_counter";
const ENV_PREFIX: &str = "POUR_COUNTER_";

/// Everything a counting run can be tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Frames skipped before each decode while both taps are closed
    pub idle_skip_frames: u32,
    /// Full-density frames after the last visible activity
    pub cooldown_frames: u32,
    pub seconds_per_beer: f64,
    /// Fractional beers above this round up
    pub rounding_threshold: f64,
    /// Pours this short or shorter are not counted
    pub min_pour_seconds: f64,
    /// Frame rate used when the video reports none
    pub fallback_fps: f64,
    /// Calibration record written by the calibration tool
    pub coords_file: PathBuf,
    /// Directory holding `<tap>_<label>.jpg` references
    pub refs_dir: PathBuf,
    /// Called with the summary after each run (optional)
    pub webhook_url: Option<String>,
    /// trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            idle_skip_frames: 50,
            cooldown_frames: 30,
            seconds_per_beer: 12.0,
            rounding_threshold: 0.6,
            min_pour_seconds: 2.0,
            fallback_fps: 30.0,
            coords_file: PathBuf::from("referencias/coords_dual.txt"),
            refs_dir: PathBuf::from("referencias"),
            webhook_url: None,
            log_level: "info".to_string(),
        }
    }
}

impl CounterConfig {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            sampling: SamplingConfig {
                idle_skip_frames: self.idle_skip_frames,
                cooldown_frames: self.cooldown_frames,
            },
            rule: CountingRule {
                seconds_per_beer: self.seconds_per_beer,
                rounding_threshold: self.rounding_threshold,
                min_pour_seconds: self.min_pour_seconds,
            },
            fallback_fps: self.fallback_fps,
        }
    }
}

/// Finite and strictly above zero; divisors such as `seconds_per_beer` must be.
pub fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Values given on the command line or in a request; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub idle_skip_frames: Option<u32>,
    pub cooldown_frames: Option<u32>,
    pub seconds_per_beer: Option<f64>,
    pub coords_file: Option<PathBuf>,
    pub refs_dir: Option<PathBuf>,
    pub webhook_url: Option<String>,
    pub log_level: Option<String>,
}

/// Values found in a single source. `None` means the source did not set it.
#[derive(Debug, Clone, Default, PartialEq)]
struct PartialConfig {
    idle_skip_frames: Option<u32>,
    cooldown_frames: Option<u32>,
    seconds_per_beer: Option<f64>,
    rounding_threshold: Option<f64>,
    min_pour_seconds: Option<f64>,
    fallback_fps: Option<f64>,
    coords_file: Option<PathBuf>,
    refs_dir: Option<PathBuf>,
    webhook_url: Option<String>,
    log_level: Option<String>,
}

impl PartialConfig {
    /// Reads every key through `lookup`; unparsable and empty values count as unset.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }
        fn text(value: Option<String>) -> Option<String> {
            value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }

        Self {
            idle_skip_frames: parsed(lookup("idle_skip_frames")),
            cooldown_frames: parsed(lookup("cooldown_frames")),
            seconds_per_beer: parsed(lookup("seconds_per_beer")),
            rounding_threshold: parsed(lookup("rounding_threshold")),
            min_pour_seconds: parsed(lookup("min_pour_seconds")),
            fallback_fps: parsed(lookup("fallback_fps")),
            coords_file: text(lookup("coords_file")).map(PathBuf::from),
            refs_dir: text(lookup("refs_dir")).map(PathBuf::from),
            webhook_url: text(lookup("webhook_url")),
            log_level: text(lookup("log_level")),
        }
    }
}

/// Resolves a [`CounterConfig`] from overrides, environment and INI files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Merges every source, highest priority first:
    /// overrides > environment > INI file > defaults.
    ///
    /// An explicitly named file must exist and parse; otherwise the default
    /// locations are searched and a missing file is not an error.
    pub fn load_config(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<CounterConfig> {
        let file = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };
        let env = Self::load_from_env();
        Ok(Self::merge(overrides, env, file))
    }

    fn merge(overrides: ConfigOverrides, env: PartialConfig, file: PartialConfig) -> CounterConfig {
        let defaults = CounterConfig::default();

        CounterConfig {
            idle_skip_frames: overrides
                .idle_skip_frames
                .or(env.idle_skip_frames)
                .or(file.idle_skip_frames)
                .unwrap_or(defaults.idle_skip_frames),
            cooldown_frames: overrides
                .cooldown_frames
                .or(env.cooldown_frames)
                .or(file.cooldown_frames)
                .unwrap_or(defaults.cooldown_frames),
            seconds_per_beer: overrides
                .seconds_per_beer
                .filter(|s| is_positive(*s))
                .or(env.seconds_per_beer.filter(|s| is_positive(*s)))
                .or(file.seconds_per_beer.filter(|s| is_positive(*s)))
                .unwrap_or(defaults.seconds_per_beer),
            rounding_threshold: env
                .rounding_threshold
                .or(file.rounding_threshold)
                .unwrap_or(defaults.rounding_threshold),
            min_pour_seconds: env
                .min_pour_seconds
                .or(file.min_pour_seconds)
                .unwrap_or(defaults.min_pour_seconds),
            fallback_fps: env
                .fallback_fps
                .filter(|fps| is_positive(*fps))
                .or(file.fallback_fps.filter(|fps| is_positive(*fps)))
                .unwrap_or(defaults.fallback_fps),
            coords_file: overrides
                .coords_file
                .or(env.coords_file)
                .or(file.coords_file)
                .unwrap_or(defaults.coords_file),
            refs_dir: overrides
                .refs_dir
                .or(env.refs_dir)
                .or(file.refs_dir)
                .unwrap_or(defaults.refs_dir),
            webhook_url: overrides.webhook_url.or(env.webhook_url).or(file.webhook_url),
            log_level: overrides
                .log_level
                .or(env.log_level)
                .or(file.log_level)
                .unwrap_or(defaults.log_level),
        }
    }

    /// `POUR_COUNTER_<KEY>` variables, e.g. `POUR_COUNTER_IDLE_SKIP_FRAMES`.
    fn load_from_env() -> PartialConfig {
        PartialConfig::from_lookup(|key| {
            env::var(format!("{}{}", ENV_PREFIX, key.to_uppercase())).ok()
        })
    }

    fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("config file not found: {}", config_path.display()));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", config_path.display(), e))?;

        debug!("[config] loaded {}", config_path.display());
        Ok(Self::from_ini(&config_parser))
    }

    /// Keys are read from `[pour_counter]`, falling back to `[DEFAULT]`.
    fn from_ini(config_parser: &configparser::ini::Ini) -> PartialConfig {
        PartialConfig::from_lookup(|key| {
            config_parser
                .get(INI_SECTION, key)
                .or_else(|| config_parser.get("DEFAULT", key))
        })
    }

    /// First existing file among `./pour-counter.ini`, `./.pour-counter.ini`,
    /// `$HOME/.pour-counter.ini` and `/etc/pour-counter.ini`.
    fn load_from_default_locations() -> Result<PartialConfig> {
        let mut candidates = vec![
            PathBuf::from("pour-counter.ini"),
            PathBuf::from(".pour-counter.ini"),
        ];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".pour-counter.ini"));
        }
        candidates.push(PathBuf::from("/etc/pour-counter.ini"));

        match candidates.iter().find(|path| path.exists()) {
            Some(path) => Self::load_from_file(path),
            None => Err(anyhow::anyhow!("no config file found")),
        }
    }

    /// Writes a config file holding every default.
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = CounterConfig::default();
        let mut config_parser = configparser::ini::Ini::new();
        let mut set = |key: &str, value: String| {
            config_parser.set(INI_SECTION, key, Some(value));
        };

        set("idle_skip_frames", defaults.idle_skip_frames.to_string());
        set("cooldown_frames", defaults.cooldown_frames.to_string());
        set("seconds_per_beer", defaults.seconds_per_beer.to_string());
        set("rounding_threshold", defaults.rounding_threshold.to_string());
        set("min_pour_seconds", defaults.min_pour_seconds.to_string());
        set("fallback_fps", defaults.fallback_fps.to_string());
        set("coords_file", defaults.coords_file.display().to_string());
        set("refs_dir", defaults.refs_dir.display().to_string());
        set("webhook_url", String::new());
        set("log_level", defaults.log_level.clone());

        config_parser
            .write(config_path)
            .map_err(|e| anyhow::anyhow!("failed to write config file {}: {}", config_path.display(), e))?;

        Ok(())
    }
}
