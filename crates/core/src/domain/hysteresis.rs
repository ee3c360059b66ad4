//! Silence hysteresis state machine
//!
//! Ducking engages on the first audible observation and releases only after a
//! run of consecutive silent observations. Source audio is often intermittent
//! (dialogue pauses, gaps between sound cues) and releasing on the first quiet
//! poll makes the music pump up and down.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Default number of consecutive silent polls before release
pub const DEFAULT_SILENCE_CHECKS: u32 = 8;

/// Whether playback is currently being suppressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuckPhase {
    #[default]
    Quiet,
    Ducking,
}

/// State change produced by one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do
    Hold,
    /// Quiet -> Ducking
    Engage,
    /// Ducking -> Quiet
    Release,
}

#[derive(Debug, Clone)]
pub struct SilenceHysteresis {
    phase: DuckPhase,
    consecutive_silence: u32,
    release_after: u32,
}

impl SilenceHysteresis {
    /// `release_after` is clamped to at least one observation
    pub fn new(release_after: u32) -> Self {
        Self {
            phase: DuckPhase::Quiet,
            consecutive_silence: 0,
            release_after: release_after.max(1),
        }
    }

    pub fn phase(&self) -> DuckPhase {
        self.phase
    }

    pub fn is_ducking(&self) -> bool {
        self.phase == DuckPhase::Ducking
    }

    pub fn consecutive_silence(&self) -> u32 {
        self.consecutive_silence
    }

    pub fn release_after(&self) -> u32 {
        self.release_after
    }

    pub fn set_release_after(&mut self, checks: u32) {
        self.release_after = checks.max(1);
    }

    /// Feed one observation
    pub fn observe(&mut self, is_playing: bool) -> Transition {
        if is_playing {
            self.consecutive_silence = 0;
            return match self.phase {
                DuckPhase::Quiet => {
                    self.phase = DuckPhase::Ducking;
                    Transition::Engage
                }
                DuckPhase::Ducking => Transition::Hold,
            };
        }

        if self.phase == DuckPhase::Quiet {
            return Transition::Hold;
        }

        self.consecutive_silence += 1;
        trace!(
            silent = self.consecutive_silence,
            needed = self.release_after,
            "Silent observation while ducking"
        );
        if self.consecutive_silence >= self.release_after {
            self.phase = DuckPhase::Quiet;
            self.consecutive_silence = 0;
            Transition::Release
        } else {
            Transition::Hold
        }
    }

    /// Restart the silence countdown without leaving the current phase
    pub fn reset_count(&mut self) {
        self.consecutive_silence = 0;
    }

    /// Drop to `Quiet` immediately; returns true if a duck was active
    pub fn force_release(&mut self) -> bool {
        let was_ducking = self.is_ducking();
        self.phase = DuckPhase::Quiet;
        self.consecutive_silence = 0;
        was_ducking
    }
}

impl Default for SilenceHysteresis {
    fn default() -> Self {
        Self::new(DEFAULT_SILENCE_CHECKS)
    }
}
