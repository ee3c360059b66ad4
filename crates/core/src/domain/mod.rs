//! Domain entities and business rules

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod fader;
pub mod hysteresis;
pub mod playback;
pub mod probe;
pub mod throttle;

// Re-export specific items to avoid ambiguous glob imports
pub use config::{
    ConfigError, ConfigManager, ConfigWatcher, DuckingConfig, LullConfig, PlaybackConfig,
    ProbeConfig,
};
pub use diagnostics::{DiagnosticEntry, DiagnosticLevel, DiagnosticLog};
pub use engine::{DuckingEngine, DuckingEvent, DuckingState};
pub use fader::{ease_out_cubic, FadeCallback, FadeJob, VolumeFader};
pub use hysteresis::{DuckPhase, SilenceHysteresis, Transition};
pub use playback::{clamp_volume, InMemoryPlayback, Playback, PlaybackError};
pub use probe::{
    targets_for, AudioProbe, DuckMode, DuckTarget, ProbeError, ProbeResult, SILENCE_THRESHOLD,
};
pub use throttle::{Coalescer, ProbeThrottle};
