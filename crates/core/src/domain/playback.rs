//! Playback transport seen by the ducking engine
//!
//! The media element or output stream belongs to the surrounding application.
//! The engine only needs to read and write its volume and pause or resume it.

use std::sync::Mutex;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("playback refused to start: {0}")]
    StartRefused(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Clamp a volume to `[0, 1]`, mapping NaN to silence
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Transport owned by the media-playback collaborator
pub trait Playback: Send + Sync {
    /// Current volume in `[0, 1]`
    fn volume(&self) -> f32;

    /// Set the volume; implementations may assume the value is already clamped
    fn set_volume(&self, volume: f32);

    fn pause(&self);

    fn play(&self) -> Result<(), PlaybackError>;

    fn is_paused(&self) -> bool;
}

#[derive(Debug)]
struct TransportState {
    volume: f32,
    paused: bool,
    volume_writes: usize,
}

/// Transport that only keeps state in memory.
///
/// Used by the CLI monitor, which has no media element of its own, and by tests.
#[derive(Debug)]
pub struct InMemoryPlayback {
    state: Mutex<TransportState>,
}

impl InMemoryPlayback {
    pub fn new(volume: f32) -> Self {
        Self {
            state: Mutex::new(TransportState {
                volume: clamp_volume(volume),
                paused: false,
                volume_writes: 0,
            }),
        }
    }

    /// Number of volume writes so far
    pub fn volume_writes(&self) -> usize {
        self.lock().volume_writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryPlayback {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Playback for InMemoryPlayback {
    fn volume(&self) -> f32 {
        self.lock().volume
    }

    fn set_volume(&self, volume: f32) {
        let mut state = self.lock();
        state.volume = clamp_volume(volume);
        state.volume_writes += 1;
        trace!(volume = state.volume, "Volume set");
    }

    fn pause(&self) {
        self.lock().paused = true;
    }

    fn play(&self) -> Result<(), PlaybackError> {
        self.lock().paused = false;
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.lock().paused
    }
}
