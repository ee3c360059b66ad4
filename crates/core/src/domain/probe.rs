//! Audio probe abstractions and domain models
//!
//! This module defines the platform-agnostic contract for querying the OS audio
//! subsystem: which output devices exist, which processes hold an audio session,
//! and how loud a watched target currently is. Implementations for specific
//! platforms (WASAPI, external helper process) live in the `infra` crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Peak level above which a target counts as audible
pub const SILENCE_THRESHOLD: f32 = 0.0001;

/// Errors that can occur while probing the audio subsystem
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    /// The native probe did not answer within its bound
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// The native capability is missing or failed to initialize
    #[error("probe not ready: {0}")]
    NotReady(String),

    /// Output did not parse as a number or a list
    #[error("malformed probe output: {0}")]
    MalformedOutput(String),

    /// No active endpoint matched the requested device name
    #[error("no audio device matches \"{0}\"")]
    TargetNotFound(String),

    /// The OS audio API reported a failure
    #[error("audio backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// How the engine decides what to watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuckMode {
    /// Watch the peak meter of named output devices
    #[default]
    Device,
    /// Watch audio sessions owned by named executables
    Exe,
}

impl fmt::Display for DuckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuckMode::Device => f.write_str("device"),
            DuckMode::Exe => f.write_str("exe"),
        }
    }
}

impl FromStr for DuckMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "device" => Ok(DuckMode::Device),
            "exe" | "process" | "program" => Ok(DuckMode::Exe),
            other => Err(format!("unknown duck mode: {other} (expected device or exe)")),
        }
    }
}

/// Something being watched for audio activity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DuckTarget {
    /// One named output device (matched by substring of its friendly name)
    Device { name: String },
    /// Processes holding a playback session, matched by lowercase exe name
    Process { exe_names: BTreeSet<String> },
}

impl DuckTarget {
    pub fn device(name: impl Into<String>) -> Self {
        DuckTarget::Device { name: name.into() }
    }

    /// Build a process target; names are trimmed and lowercased, blanks dropped
    pub fn process<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        DuckTarget::Process {
            exe_names: names
                .into_iter()
                .filter_map(|n| normalize_exe_name(n.as_ref()))
                .collect(),
        }
    }

    pub fn mode(&self) -> DuckMode {
        match self {
            DuckTarget::Device { .. } => DuckMode::Device,
            DuckTarget::Process { .. } => DuckMode::Exe,
        }
    }
}

impl fmt::Display for DuckTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuckTarget::Device { name } => write!(f, "device \"{name}\""),
            DuckTarget::Process { exe_names } => {
                let names: Vec<&str> = exe_names.iter().map(String::as_str).collect();
                write!(f, "programs [{}]", names.join(", "))
            }
        }
    }
}

/// Lowercase and trim an executable name; `None` for blank input
pub fn normalize_exe_name(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_lowercase())
    }
}

/// Expand a configured mode and name list into the targets to poll.
///
/// Device mode yields one target per non-blank device name. Exe mode yields a
/// single process target covering every configured executable. An empty result
/// means there is nothing to watch and no poll loop should run.
pub fn targets_for(mode: DuckMode, names: &[String]) -> Vec<DuckTarget> {
    match mode {
        DuckMode::Device => names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(DuckTarget::device)
            .collect(),
        DuckMode::Exe => {
            let target = DuckTarget::process(names);
            match &target {
                DuckTarget::Process { exe_names } if !exe_names.is_empty() => vec![target],
                _ => Vec::new(),
            }
        }
    }
}

/// Outcome of one probe invocation, normalized for the state machine.
///
/// An `error` means the probe could not determine state. It is never evidence
/// of silence, only absence of evidence of audio.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    pub peak_level: f32,
    pub is_playing: bool,
    pub error: Option<String>,
}

impl ProbeResult {
    /// Result for a successfully measured peak
    pub fn from_peak(peak: f32, threshold: f32) -> Self {
        let peak_level = if peak.is_finite() { peak.max(0.0) } else { 0.0 };
        Self {
            peak_level,
            is_playing: peak_level > threshold,
            error: None,
        }
    }

    /// Silent result carrying a diagnostic reason
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            peak_level: 0.0,
            is_playing: false,
            error: Some(reason.into()),
        }
    }

    /// Collapse a raw probe outcome into a result
    pub fn from_outcome(outcome: Result<f32>, threshold: f32) -> Self {
        match outcome {
            Ok(peak) => Self::from_peak(peak, threshold),
            Err(e) => Self::failed(e.to_string()),
        }
    }

    /// Combine observations of several targets taken in the same tick
    pub fn merge(self, other: ProbeResult) -> ProbeResult {
        ProbeResult {
            peak_level: self.peak_level.max(other.peak_level),
            is_playing: self.is_playing || other.is_playing,
            error: self.error.or(other.error),
        }
    }
}

/// Native audio query capability.
///
/// Each call is an independent, side-effect-free query. Implementations must
/// bound their own running time and report failures as [`ProbeError`] rather
/// than panicking.
#[async_trait]
pub trait AudioProbe: Send + Sync {
    /// Friendly names of active playback endpoints
    async fn list_devices(&self) -> Result<Vec<String>>;

    /// Lowercase executable names holding an active session on any render endpoint
    async fn list_active_session_processes(&self) -> Result<Vec<String>>;

    /// Current peak level of a target.
    ///
    /// For a process target this is the maximum across every matching session;
    /// a target process that is not running yields `Ok(0.0)`.
    async fn measure_peak(&self, target: &DuckTarget) -> Result<f32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_peak_threshold() {
        assert!(!ProbeResult::from_peak(0.0, SILENCE_THRESHOLD).is_playing);
        assert!(!ProbeResult::from_peak(SILENCE_THRESHOLD, SILENCE_THRESHOLD).is_playing);
        assert!(ProbeResult::from_peak(0.0002, SILENCE_THRESHOLD).is_playing);
    }

    #[test]
    fn test_from_peak_rejects_garbage() {
        let result = ProbeResult::from_peak(f32::NAN, SILENCE_THRESHOLD);
        assert_eq!(result.peak_level, 0.0);
        assert!(!result.is_playing);

        let result = ProbeResult::from_peak(-1.0, SILENCE_THRESHOLD);
        assert_eq!(result.peak_level, 0.0);
    }

    #[test]
    fn test_error_is_never_playing() {
        let result = ProbeResult::from_outcome(
            Err(ProbeError::Timeout(Duration::from_secs(2))),
            SILENCE_THRESHOLD,
        );
        assert!(!result.is_playing);
        assert_eq!(result.peak_level, 0.0);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_merge_keeps_max_and_any_playing() {
        let a = ProbeResult::from_peak(0.2, SILENCE_THRESHOLD);
        let b = ProbeResult::failed("not ready");
        let merged = b.merge(a);
        assert!(merged.is_playing);
        assert_eq!(merged.peak_level, 0.2);
        assert_eq!(merged.error.as_deref(), Some("not ready"));
    }

    #[test]
    fn test_process_target_normalizes_names() {
        let target = DuckTarget::process(["Spotify.EXE", "  ", " discord.exe "]);
        match target {
            DuckTarget::Process { exe_names } => {
                let names: Vec<_> = exe_names.into_iter().collect();
                assert_eq!(names, vec!["discord.exe", "spotify.exe"]);
            }
            _ => panic!("expected process target"),
        }
    }

    #[test]
    fn test_targets_for_modes() {
        let names = vec!["Speakers".to_string(), " ".to_string(), "Headset".to_string()];
        let targets = targets_for(DuckMode::Device, &names);
        assert_eq!(
            targets,
            vec![DuckTarget::device("Speakers"), DuckTarget::device("Headset")]
        );

        let exes = vec!["game.exe".to_string()];
        assert_eq!(targets_for(DuckMode::Exe, &exes).len(), 1);
        assert!(targets_for(DuckMode::Exe, &[]).is_empty());
        assert!(targets_for(DuckMode::Device, &[" ".to_string()]).is_empty());
    }

    #[test]
    fn test_duck_mode_parse() {
        assert_eq!("device".parse::<DuckMode>().unwrap(), DuckMode::Device);
        assert_eq!("EXE".parse::<DuckMode>().unwrap(), DuckMode::Exe);
        assert!("speaker".parse::<DuckMode>().is_err());
    }
}
