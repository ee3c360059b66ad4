//! Integration tests for the ducking engine
//!
//! These drive the full decision path (throttle, hysteresis, fader and the
//! orchestrator) against a fake audio subsystem whose levels change while the
//! engine runs. Timing tests use paused tokio time, so a poll tick at 400ms
//! steps is deterministic.

use async_trait::async_trait;
use lull_core::domain::config::{DuckingConfig, LullConfig};
use lull_core::domain::engine::{DuckingEngine, DuckingEvent};
use lull_core::domain::playback::{InMemoryPlayback, Playback};
use lull_core::domain::probe::{AudioProbe, DuckMode, DuckTarget, ProbeError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{sleep, sleep_until, Instant};

const POLL_MS: u64 = 400;
const NOMINAL: f32 = 0.7;

/// Audio subsystem whose device and session levels are set by the test
#[derive(Default)]
struct FakeAudio {
    devices: Mutex<Vec<(String, f32)>>,
    sessions: Mutex<HashMap<String, f32>>,
    failure: Mutex<Option<ProbeError>>,
    latency: Mutex<Duration>,
    peak_calls: AtomicUsize,
}

impl FakeAudio {
    fn with_devices(names: &[&str]) -> Arc<Self> {
        let audio = Self::default();
        *audio.devices.lock().unwrap() = names.iter().map(|n| (n.to_string(), 0.0)).collect();
        Arc::new(audio)
    }

    fn set_device_level(&self, name: &str, level: f32) {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.iter_mut().find(|(n, _)| n == name) {
            device.1 = level;
        }
    }

    /// `None` means the program is not running
    fn set_session_level(&self, exe: &str, level: Option<f32>) {
        let mut sessions = self.sessions.lock().unwrap();
        match level {
            Some(level) => sessions.insert(exe.to_string(), level),
            None => sessions.remove(exe),
        };
    }

    fn fail_with(&self, error: Option<ProbeError>) {
        *self.failure.lock().unwrap() = error;
    }

    fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    fn peak_calls(&self) -> usize {
        self.peak_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioProbe for FakeAudio {
    async fn list_devices(&self) -> Result<Vec<String>> {
        Ok(self.devices.lock().unwrap().iter().map(|(n, _)| n.clone()).collect())
    }

    async fn list_active_session_processes(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn measure_peak(&self, target: &DuckTarget) -> Result<f32> {
        self.peak_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }

        match target {
            DuckTarget::Device { name } => self
                .devices
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| name.is_empty() || n.contains(name.as_str()))
                .map(|(_, level)| *level)
                .ok_or_else(|| ProbeError::TargetNotFound(name.clone())),
            DuckTarget::Process { exe_names } => {
                let sessions = self.sessions.lock().unwrap();
                Ok(exe_names
                    .iter()
                    .filter_map(|exe| sessions.get(exe))
                    .fold(0.0f32, |max, level| max.max(*level)))
            }
        }
    }
}

fn device_config(names: &[&str]) -> DuckingConfig {
    DuckingConfig {
        enabled: true,
        mode: DuckMode::Device,
        devices: names.iter().map(|n| n.to_string()).collect(),
        ..DuckingConfig::default()
    }
}

fn exe_config(names: &[&str]) -> DuckingConfig {
    DuckingConfig {
        enabled: true,
        mode: DuckMode::Exe,
        exes: names.iter().map(|n| n.to_string()).collect(),
        ..DuckingConfig::default()
    }
}

/// Engine over `probe`, polling from the moment it is returned
fn start_engine(
    probe: Arc<dyn AudioProbe>,
    ducking: DuckingConfig,
) -> (DuckingEngine, Arc<InMemoryPlayback>, Instant) {
    let config = LullConfig {
        ducking: ducking.clone(),
        ..LullConfig::default()
    };
    let playback = Arc::new(InMemoryPlayback::default());
    let engine = DuckingEngine::new(probe, playback.clone(), &config);
    let start = Instant::now();
    engine.reconfigure(ducking);
    (engine, playback, start)
}

/// Sleep until halfway between poll tick `tick` and the next one
async fn at_tick(start: Instant, tick: u64) {
    sleep_until(start + Duration::from_millis(POLL_MS * tick + POLL_MS / 2)).await;
}

// ============================================================================
// HYSTERESIS SCENARIOS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_quick_blip_scenario() {
    let audio = FakeAudio::with_devices(&["Speakers (Realtek)"]);
    audio.set_device_level("Speakers (Realtek)", 0.5);
    let (engine, playback, start) = start_engine(audio.clone(), device_config(&["Speakers"]));
    let mut events = engine.subscribe();

    at_tick(start, 1).await;
    assert!(engine.is_ducking());
    audio.set_device_level("Speakers (Realtek)", 0.0);

    at_tick(start, 3).await;
    assert_eq!(engine.ducking_state().consecutive_silence, 2);
    audio.set_device_level("Speakers (Realtek)", 0.5);

    at_tick(start, 4).await;
    assert!(engine.is_ducking());
    assert_eq!(engine.ducking_state().consecutive_silence, 0);
    audio.set_device_level("Speakers (Realtek)", 0.0);

    at_tick(start, 11).await;
    assert!(engine.is_ducking());
    assert!(playback.is_paused());

    at_tick(start, 12).await;
    assert!(!engine.is_ducking());
    assert!(!playback.is_paused());

    assert!(matches!(events.try_recv(), Ok(DuckingEvent::Engaged { .. })));
    assert_eq!(events.try_recv(), Ok(DuckingEvent::Released { forced: false }));
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    sleep(Duration::from_millis(15_500)).await;
    assert_eq!(playback.volume(), NOMINAL);
}

#[tokio::test(start_paused = true)]
async fn test_probe_errors_during_duck() {
    let audio = FakeAudio::with_devices(&["Speakers"]);
    audio.set_device_level("Speakers", 0.5);
    let (engine, playback, start) = start_engine(audio.clone(), device_config(&["Speakers"]));

    at_tick(start, 1).await;
    assert!(engine.is_ducking());
    audio.fail_with(Some(ProbeError::Timeout(Duration::from_secs(2))));

    at_tick(start, 8).await;
    assert!(engine.is_ducking());

    at_tick(start, 9).await;
    assert!(!engine.is_ducking());
    assert!(!playback.is_paused());
    assert!(engine.last_error().unwrap().contains("timed out"));

    // Recovered probe ducks again on the next audible tick
    audio.fail_with(None);
    at_tick(start, 10).await;
    assert!(engine.is_ducking());
}

#[tokio::test(start_paused = true)]
async fn test_manual_pause_during_auto_resume() {
    let audio = FakeAudio::with_devices(&["Speakers"]);
    audio.set_device_level("Speakers", 0.5);
    let (engine, playback, start) = start_engine(audio.clone(), device_config(&["Speakers"]));

    at_tick(start, 2).await;
    assert!(playback.is_paused());
    assert!(engine.ducking_state().was_paused_by_ducking);
    engine.pause_by_user();
    audio.set_device_level("Speakers", 0.0);

    at_tick(start, 10).await;
    assert!(!engine.is_ducking());
    assert!(playback.is_paused());

    sleep(Duration::from_millis(15_500)).await;
    assert_eq!(playback.volume(), NOMINAL);
    assert!(playback.is_paused());

    engine.resume_by_user().unwrap();
    assert!(!playback.is_paused());
}

// ============================================================================
// TARGET CONFIGURATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_empty_targets_stay_idle() {
    let audio = FakeAudio::with_devices(&["Speakers"]);
    audio.set_session_level("game.exe", Some(0.4));
    let (engine, _playback, _start) = start_engine(audio.clone(), exe_config(&[]));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(audio.peak_calls(), 0);
    assert!(!engine.is_ducking());
    assert!(!engine.ducking_state().polling);

    engine.set_duck_targets(DuckMode::Exe, vec!["Game.exe".to_string()]);
    sleep(Duration::from_millis(600)).await;
    assert!(engine.is_ducking());
}

#[tokio::test(start_paused = true)]
async fn test_mode_switch_keeps_duck_until_silence() {
    let audio = FakeAudio::with_devices(&["Speakers"]);
    audio.set_device_level("Speakers", 0.5);
    let (engine, playback, start) = start_engine(audio.clone(), device_config(&["Speakers"]));

    at_tick(start, 1).await;
    assert!(engine.is_ducking());

    // game.exe is not running: silent, not an error
    let switched = Instant::now();
    engine.set_duck_targets(DuckMode::Exe, vec!["game.exe".to_string()]);
    assert!(engine.is_ducking());
    assert_eq!(engine.ducking_state().consecutive_silence, 0);

    sleep_until(switched + Duration::from_millis(POLL_MS * 8 - 100)).await;
    assert!(engine.is_ducking());

    sleep_until(switched + Duration::from_millis(POLL_MS * 8 + 100)).await;
    assert!(!engine.is_ducking());
    assert!(!playback.is_paused());
    assert!(engine.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_any_session_of_any_target_ducks() {
    let audio = FakeAudio::with_devices(&["Speakers"]);
    audio.set_session_level("spotify.exe", Some(0.0));
    audio.set_session_level("game.exe", Some(0.2));
    let (engine, _playback, _start) =
        start_engine(audio.clone(), exe_config(&["spotify.exe", "game.exe"]));

    sleep(Duration::from_millis(600)).await;
    let state = engine.ducking_state();
    assert!(state.is_ducking);
    assert_eq!(state.last_result.peak_level, 0.2);
}

#[tokio::test(start_paused = true)]
async fn test_multiple_devices() {
    let audio = FakeAudio::with_devices(&["Speakers (Realtek)", "Headset (USB)"]);
    audio.set_device_level("Headset (USB)", 0.3);
    let (engine, _playback, _start) =
        start_engine(audio.clone(), device_config(&["HDMI", "Speakers", "Headset"]));

    sleep(Duration::from_millis(600)).await;
    let state = engine.ducking_state();
    assert!(state.is_ducking);
    assert_eq!(state.last_result.peak_level, 0.3);
    // The missing HDMI device is reported but does not stop the others
    assert!(engine.last_error().unwrap().contains("HDMI"));
}

#[tokio::test(start_paused = true)]
async fn test_disable_mid_duck() {
    let audio = FakeAudio::with_devices(&["Speakers"]);
    audio.set_device_level("Speakers", 0.5);
    let (engine, playback, start) = start_engine(audio.clone(), device_config(&["Speakers"]));
    let mut events = engine.subscribe();

    at_tick(start, 2).await;
    assert!(playback.is_paused());

    engine.set_ducking_enabled(false);
    let calls = audio.peak_calls();
    assert!(!playback.is_paused());

    sleep(Duration::from_millis(600)).await;
    assert_eq!(playback.volume(), NOMINAL);
    assert_eq!(audio.peak_calls(), calls);
    assert!(matches!(events.try_recv(), Ok(DuckingEvent::Engaged { .. })));
    assert_eq!(events.try_recv(), Ok(DuckingEvent::Released { forced: true }));
}

// ============================================================================
// PROBE LATENCY
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_probe_is_not_piled_up() {
    let audio = FakeAudio::with_devices(&["Speakers"]);
    audio.set_device_level("Speakers", 0.5);
    audio.set_latency(Duration::from_millis(1000));
    let (engine, _playback, start) = start_engine(audio.clone(), device_config(&["Speakers"]));

    // First probe issued at 400ms resolves at 1400ms
    sleep_until(start + Duration::from_millis(1300)).await;
    assert!(!engine.is_ducking());
    assert_eq!(audio.peak_calls(), 1);

    sleep_until(start + Duration::from_millis(1500)).await;
    assert!(engine.is_ducking());

    sleep_until(start + Duration::from_millis(10_000)).await;
    let calls = audio.peak_calls();
    assert!((5..=10).contains(&calls), "{calls} probes in 10s");
    assert!(engine.is_ducking());
}

#[tokio::test(start_paused = true)]
async fn test_picker_queries() {
    let audio = FakeAudio::with_devices(&["Speakers", "Headset"]);
    audio.set_session_level("game.exe", Some(0.0));
    let (engine, _playback, _start) = start_engine(audio, exe_config(&[]));

    assert_eq!(engine.list_audio_devices().await, vec!["Speakers", "Headset"]);
    assert_eq!(engine.list_audio_sessions().await, vec!["game.exe"]);
}

// ============================================================================
// EXTERNAL HELPER
// ============================================================================

#[cfg(unix)]
mod helper {
    use super::*;
    use lull_core::domain::config::ProbeConfig;
    use lull_infra::audio::HelperProbe;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_helper(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    async fn wait_for(engine: &DuckingEngine, ducking: bool) -> bool {
        for _ in 0..250 {
            if engine.is_ducking() == ducking {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Real processes, so real time with a short poll
    #[tokio::test]
    async fn test_helper_readiness_self_heals() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lull-helper");
        write_helper(&path, "echo 0.5");

        let probe = Arc::new(HelperProbe::new(path.clone(), &ProbeConfig::default()));
        let ducking = DuckingConfig {
            poll_interval_ms: 50,
            silence_checks: 3,
            duck_fade_ms: 10,
            release_fade_ms: 10,
            ..device_config(&["Speakers"])
        };
        let (engine, _playback, _start) = start_engine(probe, ducking);

        assert!(wait_for(&engine, true).await, "helper output should duck");

        std::fs::remove_file(&path).unwrap();
        assert!(wait_for(&engine, false).await, "missing helper counts as silence");
        assert!(engine.last_error().unwrap().contains("not ready"));

        write_helper(&path, "echo 0.5");
        assert!(wait_for(&engine, true).await, "restored helper should duck again");
        engine.stop();
    }
}
