//! Ducking orchestrator
//!
//! [`DuckingEngine`] owns the poll timer and is the only writer of the
//! playback transport. Each tick asks the [`ProbeThrottle`] about the configured
//! targets, feeds the answer to the [`SilenceHysteresis`] machine and turns its
//! transitions into fades and pause/resume calls.
//!
//! Lock order is engine state, then fader, then transport. Fade completion
//! callbacks run on the runtime and re-enter the engine through a `Weak`, never
//! while the fader holds its own lock.

use crate::domain::config::{DuckingConfig, LullConfig};
use crate::domain::diagnostics::{DiagnosticEntry, DiagnosticLevel, DiagnosticLog, DEFAULT_CAPACITY};
use crate::domain::fader::VolumeFader;
use crate::domain::hysteresis::{SilenceHysteresis, Transition};
use crate::domain::playback::{clamp_volume, Playback, PlaybackError};
use crate::domain::probe::{AudioProbe, DuckMode, DuckTarget, ProbeResult};
use crate::domain::throttle::ProbeThrottle;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Shortest poll period the engine will schedule
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ducking transitions, for UI indicators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DuckingEvent {
    Engaged { peak_level: f32 },
    /// `forced` is set when ducking was switched off or the targets cleared mid-duck
    Released { forced: bool },
}

/// Snapshot of the engine for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuckingState {
    pub is_ducking: bool,
    pub enabled: bool,
    pub polling: bool,
    pub consecutive_silence: u32,
    pub was_paused_by_ducking: bool,
    pub manually_paused: bool,
    pub nominal_volume: f32,
    pub last_result: ProbeResult,
}

struct EngineState {
    config: DuckingConfig,
    targets: Vec<DuckTarget>,
    hysteresis: SilenceHysteresis,
    was_paused_by_ducking: bool,
    manually_paused: bool,
    nominal_volume: f32,
    last_result: ProbeResult,
    /// Bumped on every stop/restart; ticks from an older generation are dropped
    generation: u64,
    poll_task: Option<JoinHandle<()>>,
    diagnostics: DiagnosticLog,
}

struct EngineInner {
    throttle: ProbeThrottle,
    playback: Arc<dyn Playback>,
    fader: VolumeFader,
    state: Mutex<EngineState>,
    events: broadcast::Sender<DuckingEvent>,
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Probe every target in order, stopping at the first audible one
    async fn observe(&self, targets: &[DuckTarget]) -> ProbeResult {
        let mut merged = ProbeResult::default();
        for target in targets {
            merged = merged.merge(self.throttle.measure(target).await);
            if merged.is_playing {
                break;
            }
        }
        merged
    }

    /// Duck-in fade finished: pause unless the duck was already released
    fn pause_after_duck(&self) {
        let mut state = self.lock();
        if !state.hysteresis.is_ducking() || state.manually_paused {
            return;
        }
        self.playback.pause();
        state.was_paused_by_ducking = true;
        debug!("Playback paused by ducking");
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(task) = self.lock().poll_task.take() {
            task.abort();
        }
    }
}

/// Automatic ducking of one playback stream.
///
/// Cheap to clone; clones share the same engine. Must be used from within a
/// tokio runtime.
#[derive(Clone)]
pub struct DuckingEngine {
    inner: Arc<EngineInner>,
}

impl DuckingEngine {
    /// Build an idle engine and apply the nominal volume to the transport.
    ///
    /// Polling does not begin until [`start`](Self::start),
    /// [`set_ducking_enabled`](Self::set_ducking_enabled) or
    /// [`reconfigure`](Self::reconfigure) is called.
    pub fn new(probe: Arc<dyn AudioProbe>, playback: Arc<dyn Playback>, config: &LullConfig) -> Self {
        let nominal_volume = clamp_volume(config.playback.volume);
        playback.set_volume(nominal_volume);

        let (events, _) = broadcast::channel(32);
        let state = EngineState {
            targets: config.ducking.targets(),
            hysteresis: SilenceHysteresis::new(config.ducking.silence_checks),
            config: config.ducking.clone(),
            was_paused_by_ducking: false,
            manually_paused: false,
            nominal_volume,
            last_result: ProbeResult::default(),
            generation: 0,
            poll_task: None,
            diagnostics: DiagnosticLog::new(DEFAULT_CAPACITY),
        };

        Self {
            inner: Arc::new(EngineInner {
                throttle: ProbeThrottle::new(probe, config.probe.silence_threshold),
                fader: VolumeFader::new(Arc::clone(&playback)),
                playback,
                state: Mutex::new(state),
                events,
            }),
        }
    }

    /// Begin polling `targets`; a no-op when `targets` is empty.
    ///
    /// The given targets are polled until the next reconfiguration.
    pub fn start(&self, targets: Vec<DuckTarget>, poll_interval: Duration, silence_checks: u32) {
        if targets.is_empty() {
            debug!("No duck targets, not polling");
            return;
        }
        let mut state = self.inner.lock();
        state.config.enabled = true;
        state.config.poll_interval_ms = poll_interval.as_millis() as u64;
        state.config.silence_checks = silence_checks.max(1);
        state.targets = targets;
        restart_polling(&self.inner, &mut state);
    }

    /// Halt polling and clear the silence count.
    ///
    /// An active duck stays in place; playback is left as it is.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        if stop_polling(&mut state) {
            info!("Polling stopped");
        }
    }

    /// Turn ducking on or off. Turning it off mid-duck releases with the fast fade.
    pub fn set_ducking_enabled(&self, enabled: bool) {
        let mut state = self.inner.lock();
        state.config.enabled = enabled;
        info!(enabled, "Ducking toggled");
        apply(&self.inner, &mut state);
    }

    /// Replace the watched names for `mode` and make it the active mode
    pub fn set_duck_targets(&self, mode: DuckMode, names: Vec<String>) {
        let mut state = self.inner.lock();
        state.config.set_targets(mode, names);
        info!(%mode, count = state.config.active_names().len(), "Duck targets changed");
        apply(&self.inner, &mut state);
    }

    /// Apply a whole ducking section, e.g. after the config file changed
    pub fn reconfigure(&self, config: DuckingConfig) {
        let mut state = self.inner.lock();
        if state.config == config && (state.poll_task.is_some() || !config.enabled) {
            trace!("Ducking config unchanged");
            return;
        }
        state.config = config;
        apply(&self.inner, &mut state);
    }

    /// Record the user's volume; applied now unless a duck is holding it down
    pub fn set_volume(&self, volume: f32) {
        let mut state = self.inner.lock();
        state.nominal_volume = clamp_volume(volume);
        if !state.hysteresis.is_ducking() {
            self.inner.fader.cancel();
            self.inner.playback.set_volume(state.nominal_volume);
        }
    }

    pub fn nominal_volume(&self) -> f32 {
        self.inner.lock().nominal_volume
    }

    /// Manual pause; suppresses the automatic resume after a duck
    pub fn pause_by_user(&self) {
        let mut state = self.inner.lock();
        self.pause_locked(&mut state);
    }

    /// Manual resume; clears any pause the engine made on its own
    pub fn resume_by_user(&self) -> Result<(), PlaybackError> {
        let mut state = self.inner.lock();
        self.resume_locked(&mut state)
    }

    /// Transport state is read under the engine lock so a duck-in pause
    /// cannot land between the check and the action
    pub fn toggle_play_pause(&self) -> Result<(), PlaybackError> {
        let mut state = self.inner.lock();
        if self.inner.playback.is_paused() {
            self.resume_locked(&mut state)
        } else {
            self.pause_locked(&mut state);
            Ok(())
        }
    }

    fn pause_locked(&self, state: &mut EngineState) {
        state.manually_paused = true;
        self.inner.playback.pause();
        debug!("Playback paused by user");
    }

    fn resume_locked(&self, state: &mut EngineState) -> Result<(), PlaybackError> {
        state.manually_paused = false;
        state.was_paused_by_ducking = false;
        self.inner.playback.play()?;
        debug!("Playback resumed by user");
        Ok(())
    }

    pub fn is_ducking(&self) -> bool {
        self.inner.lock().hysteresis.is_ducking()
    }

    pub fn ducking_state(&self) -> DuckingState {
        let state = self.inner.lock();
        DuckingState {
            is_ducking: state.hysteresis.is_ducking(),
            enabled: state.config.enabled,
            polling: state.poll_task.is_some(),
            consecutive_silence: state.hysteresis.consecutive_silence(),
            was_paused_by_ducking: state.was_paused_by_ducking,
            manually_paused: state.manually_paused,
            nominal_volume: state.nominal_volume,
            last_result: state.last_result.clone(),
        }
    }

    pub fn diagnostics(&self) -> Vec<DiagnosticEntry> {
        self.inner.lock().diagnostics.entries()
    }

    /// Most recent probe failure reason, for the debug view
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().diagnostics.last_error().map(str::to_string)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DuckingEvent> {
        self.inner.events.subscribe()
    }

    /// Active playback device names, for a picker
    pub async fn list_audio_devices(&self) -> Vec<String> {
        self.inner.throttle.list_devices().await
    }

    /// Executables with an active audio session, for a picker
    pub async fn list_audio_sessions(&self) -> Vec<String> {
        self.inner.throttle.list_sessions().await
    }
}

/// Start or stop polling to match the current config
fn apply(inner: &Arc<EngineInner>, state: &mut EngineState) {
    state.targets = state.config.targets();
    if state.config.enabled && !state.targets.is_empty() {
        restart_polling(inner, state);
        return;
    }

    if stop_polling(state) {
        info!("Polling stopped");
    }
    if state.hysteresis.force_release() {
        let fade = state.config.disable_release_fade();
        release(inner, state, fade, true);
    }
}

fn restart_polling(inner: &Arc<EngineInner>, state: &mut EngineState) {
    stop_polling(state);
    state.hysteresis.set_release_after(state.config.silence_checks);

    let period = state.config.poll_interval().max(MIN_POLL_INTERVAL);
    let generation = state.generation;
    state.poll_task = Some(spawn_poll_loop(Arc::downgrade(inner), generation, period));

    let targets: Vec<String> = state.targets.iter().map(ToString::to_string).collect();
    info!(
        targets = %targets.join(", "),
        period_ms = period.as_millis() as u64,
        release_after = state.hysteresis.release_after(),
        "Polling started"
    );
}

/// Returns true if a poll loop was running
fn stop_polling(state: &mut EngineState) -> bool {
    state.generation += 1;
    state.hysteresis.reset_count();
    match state.poll_task.take() {
        Some(task) => {
            task.abort();
            true
        }
        None => false,
    }
}

fn spawn_poll_loop(engine: Weak<EngineInner>, generation: u64, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(inner) = engine.upgrade() else {
                return;
            };
            // A slow probe must not hold back the next tick
            tokio::spawn(on_poll_tick(inner, generation));
        }
    })
}

async fn on_poll_tick(inner: Arc<EngineInner>, generation: u64) {
    let targets = {
        let state = inner.lock();
        if state.generation != generation {
            return;
        }
        state.targets.clone()
    };

    let result = inner.observe(&targets).await;

    let mut state = inner.lock();
    if state.generation != generation {
        trace!(generation, "Dropping result from previous configuration");
        return;
    }

    if let Some(reason) = &result.error {
        state.diagnostics.push(DiagnosticLevel::Error, reason.clone());
    }
    let transition = state.hysteresis.observe(result.is_playing);
    let silent = state.hysteresis.consecutive_silence();
    let needed = state.hysteresis.release_after();
    debug!(
        peak = result.peak_level,
        playing = result.is_playing,
        silent,
        needed,
        "Poll tick"
    );
    state.diagnostics.push(
        DiagnosticLevel::Debug,
        format!(
            "peak={:.4} playing={} silent={}/{}",
            result.peak_level, result.is_playing, silent, needed
        ),
    );
    state.last_result = result;

    match transition {
        Transition::Hold => {}
        Transition::Engage => engage(&inner, &mut state),
        Transition::Release => {
            let fade = state.config.release_fade();
            release(&inner, &mut state, fade, false);
        }
    }
}

fn engage(inner: &Arc<EngineInner>, state: &mut EngineState) {
    let peak_level = state.last_result.peak_level;
    info!(peak = peak_level, "Competing audio detected, ducking");
    state
        .diagnostics
        .push(DiagnosticLevel::Info, format!("ducking (peak {peak_level:.4})"));

    let engine = Arc::downgrade(inner);
    inner.fader.fade(
        0.0,
        state.config.duck_fade(),
        Some(Box::new(move || {
            if let Some(inner) = engine.upgrade() {
                inner.pause_after_duck();
            }
        })),
    );
    let _ = inner.events.send(DuckingEvent::Engaged { peak_level });
}

fn release(inner: &Arc<EngineInner>, state: &mut EngineState, fade: Duration, forced: bool) {
    info!(forced, fade_ms = fade.as_millis() as u64, "Releasing duck");
    state.diagnostics.push(
        DiagnosticLevel::Info,
        if forced { "released (forced)" } else { "released" },
    );

    if state.was_paused_by_ducking && !state.manually_paused {
        if let Err(e) = inner.playback.play() {
            warn!(error = %e, "Could not resume playback after duck");
            state.diagnostics.push(DiagnosticLevel::Warn, e.to_string());
        }
    }
    state.was_paused_by_ducking = false;

    inner.fader.fade(state.nominal_volume, fade, None);
    let _ = inner.events.send(DuckingEvent::Released { forced });
}
