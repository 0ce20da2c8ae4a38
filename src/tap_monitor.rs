use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::calibration::Roi;
use crate::classifier;
use crate::reference::{ReferenceSet, TapId, TapState};

/// Absorbs representation error so that a fractional part of exactly the
/// threshold (e.g. 19.2 s / 12 s = 1.6000000000000003) does not round up.
const ROUNDING_EPSILON: f64 = 1e-9;

/// Turns a pour duration into a beer count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountingRule {
    /// Pour time that makes one beer.
    pub seconds_per_beer: f64,
    /// Fractional beers above this round up.
    pub rounding_threshold: f64,
    /// Pours this short or shorter are treated as classification flicker.
    pub min_pour_seconds: f64,
}

impl Default for CountingRule {
    fn default() -> Self {
        Self {
            seconds_per_beer: 12.0,
            rounding_threshold: 0.6,
            min_pour_seconds: 2.0,
        }
    }
}

impl CountingRule {
    /// Replaces a `seconds_per_beer` that is zero, negative or not finite
    /// with the default, so a pour always maps to a sane beer count.
    pub fn sanitized(self) -> Self {
        if self.seconds_per_beer.is_finite() && self.seconds_per_beer > 0.0 {
            return self;
        }
        let fallback = Self::default().seconds_per_beer;
        warn!(
            "⚠️  [counter] unusable seconds_per_beer {}, using {}",
            self.seconds_per_beer, fallback
        );
        Self {
            seconds_per_beer: fallback,
            ..self
        }
    }
}

/// Beers for one closed pour, or `None` when the pour is too short to count.
///
/// Every pour that counts is worth at least one beer.
pub fn beers_for_duration(duration: f64, rule: &CountingRule) -> Option<u32> {
    if duration <= rule.min_pour_seconds {
        return None;
    }

    let raw = duration / rule.seconds_per_beer;
    let int_part = raw.floor();
    let fractional = raw - int_part;

    let mut beers = int_part as u32;
    if fractional > rule.rounding_threshold + ROUNDING_EPSILON {
        beers += 1;
    }
    Some(beers.max(1))
}

/// A completed, counted pour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PourEvent {
    pub tap: TapId,
    /// Seconds from the start of the video.
    pub start: f64,
    pub end: f64,
    pub duration: f64,
    pub beers: u32,
}

/// Per-tap state machine: tracks the current state, times pours and
/// accumulates beers.
#[derive(Debug, Clone)]
pub struct TapMonitor {
    tap: TapId,
    roi: Roi,
    references: Arc<ReferenceSet>,
    rule: CountingRule,
    state: TapState,
    state_since: f64,
    beers: u32,
    pouring_seconds: f64,
    events: Vec<PourEvent>,
}

impl TapMonitor {
    /// References whose size differs from the region are resized once here
    /// rather than on every frame.
    pub fn new(tap: TapId, roi: Roi, references: Arc<ReferenceSet>, rule: CountingRule) -> Self {
        let rule = rule.sanitized();
        let dimensions = roi.dimensions();
        let references = if references.matches_dimensions(dimensions) {
            references
        } else {
            debug!("[counter] tap {}: fitting references to {:?}", tap, dimensions);
            Arc::new(references.fitted_to(dimensions))
        };

        Self {
            tap,
            roi,
            references,
            rule,
            state: TapState::Closed,
            state_since: 0.0,
            beers: 0,
            pouring_seconds: 0.0,
            events: Vec::new(),
        }
    }

    /// Classifies this tap's region of a preprocessed frame.
    pub fn classify(&self, frame: &GrayImage) -> TapState {
        classifier::classify(frame, &self.roi, &self.references)
    }

    /// Feeds the state detected at `frame_index`. Returns the event emitted
    /// when this frame closes a pour that counts.
    pub fn update(&mut self, detected: TapState, frame_index: u64, fps: f64) -> Option<&PourEvent> {
        debug_assert!(fps > 0.0);
        let now = frame_index as f64 / fps;
        let was_pouring = self.state.is_pouring();

        if detected == self.state {
            return None;
        }

        if !was_pouring {
            // closed <-> foam, or the start of a pour
            self.state = detected;
            self.state_since = now;
            if detected.is_pouring() {
                debug!("[counter] tap {}: pour started at {:.2}s", self.tap, now);
            }
            return None;
        }

        let start = self.state_since;
        let duration = now - start;
        self.pouring_seconds += duration;
        self.state = detected;
        self.state_since = now;

        let beers = match beers_for_duration(duration, &self.rule) {
            Some(beers) => beers,
            None => {
                debug!(
                    "[counter] tap {}: ignored {:.2}s pour at {:.2}s",
                    self.tap, duration, start
                );
                return None;
            }
        };

        self.beers = self.beers.saturating_add(beers);
        info!(
            "🍺 [counter] tap {}: {:.2}s-{:.2}s ({:.2}s) -> {} beer(s)",
            self.tap, start, now, duration, beers
        );
        self.events.push(PourEvent {
            tap: self.tap,
            start,
            end: now,
            duration,
            beers,
        });
        self.events.last()
    }

    pub fn tap(&self) -> TapId {
        self.tap
    }

    pub fn roi(&self) -> Roi {
        self.roi
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    pub fn beers(&self) -> u32 {
        self.beers
    }

    pub fn pouring_seconds(&self) -> f64 {
        self.pouring_seconds
    }

    pub fn events(&self) -> &[PourEvent] {
        &self.events
    }

    /// Start time of a pour that has not closed yet.
    pub fn open_pour_start(&self) -> Option<f64> {
        self.state.is_pouring().then_some(self.state_since)
    }

    pub fn into_events(self) -> Vec<PourEvent> {
        self.events
    }
}
