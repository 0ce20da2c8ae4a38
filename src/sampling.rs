use serde::{Deserialize, Serialize};

use crate::reference::TapState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Frames grabbed without conversion before each decode while idle.
    pub idle_skip_frames: u32,
    /// Decoded frames kept at full density after the last visible activity.
    pub cooldown_frames: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            idle_skip_frames: 50,
            cooldown_frames: 30,
        }
    }
}

/// Adaptive frame skipping: sparse sampling while both taps are closed,
/// every frame for a cooldown window after any activity.
#[derive(Debug, Clone)]
pub struct SamplingController {
    config: SamplingConfig,
    cooldown: u32,
}

impl SamplingController {
    pub fn new(config: SamplingConfig) -> Self {
        Self {
            config,
            cooldown: 0,
        }
    }

    /// Frames to skip before decoding the next one.
    pub fn frames_to_skip(&self) -> u32 {
        if self.cooldown == 0 {
            self.config.idle_skip_frames
        } else {
            0
        }
    }

    /// Feeds the states classified on the last decoded frame.
    pub fn observe(&mut self, states: &[TapState]) {
        if states.iter().any(TapState::is_active) {
            self.cooldown = self.config.cooldown_frames;
        } else {
            self.cooldown = self.cooldown.saturating_sub(1);
        }
    }

    pub fn cooldown(&self) -> u32 {
        self.cooldown
    }

    pub fn is_idle(&self) -> bool {
        self.cooldown == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_idle() {
        let sampler = SamplingController::new(SamplingConfig::default());
        assert!(sampler.is_idle());
        assert_eq!(sampler.frames_to_skip(), 50);
    }

    #[test]
    fn test_any_activity_resets_cooldown() {
        let mut sampler = SamplingController::new(SamplingConfig::default());
        sampler.observe(&[TapState::Closed, TapState::Foam]);
        assert_eq!(sampler.cooldown(), 30);
        assert_eq!(sampler.frames_to_skip(), 0);

        sampler.observe(&[TapState::Closed, TapState::Closed]);
        assert_eq!(sampler.cooldown(), 29);

        sampler.observe(&[TapState::Pouring, TapState::Closed]);
        assert_eq!(sampler.cooldown(), 30);
    }

    #[test]
    fn test_cooldown_drains_back_to_idle() {
        let config = SamplingConfig {
            idle_skip_frames: 10,
            cooldown_frames: 3,
        };
        let mut sampler = SamplingController::new(config);
        sampler.observe(&[TapState::Pouring]);
        for expected in [2, 1, 0, 0] {
            sampler.observe(&[TapState::Closed]);
            assert_eq!(sampler.cooldown(), expected);
        }
        assert_eq!(sampler.frames_to_skip(), 10);
    }
}
