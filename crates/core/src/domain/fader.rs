//! Volume fades on a fixed tick
//!
//! A fade always starts from the transport's *current* volume, so a fade that
//! interrupts another continues from wherever the first one left off. Starting
//! a fade cancels the one in flight: there is no queuing and no blending.

use crate::domain::playback::{clamp_volume, Playback};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Animation step, roughly one display frame
pub const FADE_TICK: Duration = Duration::from_millis(16);

/// Fast fade used when competing audio starts
pub const DUCK_FADE: Duration = Duration::from_millis(300);

/// Slow fade back to the nominal volume after a release
pub const RELEASE_FADE: Duration = Duration::from_millis(15_000);

/// Release fade used when the user turns ducking off mid-duck
pub const DISABLE_RELEASE_FADE: Duration = Duration::from_millis(500);

/// Callback run once a fade reaches its target
pub type FadeCallback = Box<dyn FnOnce() + Send + 'static>;

/// Cubic ease-out: fast start, gentle landing
pub fn ease_out_cubic(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(3)
}

/// One fade from `start_volume` to `target_volume`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeJob {
    pub start_volume: f32,
    pub target_volume: f32,
    pub duration: Duration,
    pub started_at: Instant,
}

impl FadeJob {
    /// Normalized progress in `[0, 1]`
    pub fn progress(&self, now: Instant) -> f32 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.started_at);
        (elapsed.as_secs_f32() / self.duration.as_secs_f32()).clamp(0.0, 1.0)
    }

    /// Eased volume at progress `t`
    pub fn volume_at(&self, t: f32) -> f32 {
        if t >= 1.0 {
            return self.target_volume;
        }
        let delta = self.target_volume - self.start_volume;
        clamp_volume(self.start_volume + delta * ease_out_cubic(t))
    }
}

#[derive(Default)]
struct FaderState {
    generation: u64,
    active: Option<FadeJob>,
    task: Option<JoinHandle<()>>,
}

fn lock(state: &Mutex<FaderState>) -> MutexGuard<'_, FaderState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Animates the volume of a single playback stream.
///
/// Must be used from within a tokio runtime.
pub struct VolumeFader {
    playback: Arc<dyn Playback>,
    state: Arc<Mutex<FaderState>>,
    tick: Duration,
}

impl VolumeFader {
    pub fn new(playback: Arc<dyn Playback>) -> Self {
        Self::with_tick(playback, FADE_TICK)
    }

    pub fn with_tick(playback: Arc<dyn Playback>, tick: Duration) -> Self {
        Self {
            playback,
            state: Arc::new(Mutex::new(FaderState::default())),
            tick: tick.max(Duration::from_millis(1)),
        }
    }

    /// Fade to `target` over `duration`, replacing any fade in flight.
    ///
    /// The final write is exactly `target` (clamped to `[0, 1]`). A zero
    /// duration writes it before returning. `on_complete` runs on the runtime
    /// after the final write and is dropped unrun if the fade is superseded.
    pub fn fade(&self, target: f32, duration: Duration, on_complete: Option<FadeCallback>) {
        let target = clamp_volume(target);
        let mut state = lock(&self.state);

        state.generation += 1;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        let generation = state.generation;

        let job = FadeJob {
            start_volume: clamp_volume(self.playback.volume()),
            target_volume: target,
            duration,
            started_at: Instant::now(),
        };
        debug!(
            from = job.start_volume,
            to = job.target_volume,
            ms = duration.as_millis() as u64,
            "Starting fade"
        );

        if duration.is_zero() {
            self.playback.set_volume(target);
            state.active = None;
            drop(state);
            if let Some(callback) = on_complete {
                tokio::spawn(async move { callback() });
            }
            return;
        }

        state.active = Some(job);
        let playback = Arc::clone(&self.playback);
        let shared = Arc::clone(&self.state);
        let tick = self.tick;

        state.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(job.started_at + tick, tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let mut state = lock(&shared);
                if state.generation != generation {
                    return;
                }

                let t = job.progress(Instant::now());
                if t >= 1.0 {
                    playback.set_volume(job.target_volume);
                    state.active = None;
                    state.task = None;
                    drop(state);
                    trace!(volume = job.target_volume, "Fade complete");
                    if let Some(callback) = on_complete {
                        callback();
                    }
                    return;
                }

                playback.set_volume(job.volume_at(t));
            }
        }));
    }

    /// Stop the fade in flight where it is; its callback never runs
    pub fn cancel(&self) -> Option<FadeJob> {
        let mut state = lock(&self.state);
        state.generation += 1;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.active.take()
    }

    pub fn is_fading(&self) -> bool {
        lock(&self.state).active.is_some()
    }

    pub fn active_job(&self) -> Option<FadeJob> {
        lock(&self.state).active
    }
}

impl Drop for VolumeFader {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.state).task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::playback::InMemoryPlayback;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::sleep;

    fn fader_at(volume: f32) -> (Arc<InMemoryPlayback>, VolumeFader) {
        let playback = Arc::new(InMemoryPlayback::new(volume));
        let fader = VolumeFader::new(playback.clone());
        (playback, fader)
    }

    fn flag() -> (Arc<AtomicBool>, FadeCallback) {
        let flag = Arc::new(AtomicBool::new(false));
        let set = Arc::clone(&flag);
        (flag, Box::new(move || set.store(true, Ordering::SeqCst)))
    }

    #[test]
    fn test_ease_out_cubic_endpoints() {
        assert_eq!(ease_out_cubic(0.0), 0.0);
        assert_eq!(ease_out_cubic(1.0), 1.0);
        assert!((ease_out_cubic(0.5) - 0.875).abs() < 1e-6);
        assert_eq!(ease_out_cubic(2.0), 1.0);
    }

    #[test]
    fn test_job_trajectory() {
        let job = FadeJob {
            start_volume: 0.8,
            target_volume: 0.0,
            duration: Duration::from_millis(300),
            started_at: Instant::now(),
        };
        assert!((job.volume_at(0.0) - 0.8).abs() < 1e-6);
        assert!((job.volume_at(0.5) - 0.1).abs() < 1e-6);
        assert_eq!(job.volume_at(1.0), 0.0);

        let mut last = job.volume_at(0.0);
        for step in 1..=20 {
            let v = job.volume_at(step as f32 / 20.0);
            assert!(v <= last);
            last = v;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fade_lands_exactly_on_target() {
        for (start, target, ms) in [(0.7, 0.0, 300), (0.0, 0.37, 15_000), (0.33, 0.9, 17)] {
            let (playback, fader) = fader_at(start);
            let (done, callback) = flag();

            fader.fade(target, Duration::from_millis(ms), Some(callback));
            assert!(fader.is_fading());

            sleep(Duration::from_millis(ms + 100)).await;
            assert_eq!(playback.volume(), target);
            assert!(!fader.is_fading());
            assert!(done.load(Ordering::SeqCst));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_fade() {
        let (playback, fader) = fader_at(0.4);
        let (done, callback) = flag();

        fader.fade(0.9, Duration::ZERO, Some(callback));
        assert_eq!(playback.volume(), 0.9);
        assert!(!fader.is_fading());

        tokio::task::yield_now().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fade_moves_gradually() {
        let (playback, fader) = fader_at(1.0);
        fader.fade(0.0, Duration::from_millis(1000), None);

        sleep(Duration::from_millis(250)).await;
        let early = playback.volume();
        assert!(early < 1.0 && early > 0.0);

        sleep(Duration::from_millis(250)).await;
        assert!(playback.volume() < early);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_fade_cancels_previous() {
        let (playback, fader) = fader_at(0.8);
        let (a_done, a_callback) = flag();
        let (b_done, b_callback) = flag();

        fader.fade(0.0, Duration::from_millis(1000), Some(a_callback));
        sleep(Duration::from_millis(100)).await;
        let mid = playback.volume();

        fader.fade(1.0, Duration::from_millis(200), Some(b_callback));
        let job = fader.active_job().unwrap();
        assert_eq!(job.start_volume, mid);

        sleep(Duration::from_millis(2000)).await;
        assert_eq!(playback.volume(), 1.0);
        assert!(!a_done.load(Ordering::SeqCst));
        assert!(b_done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_freezes_volume() {
        let (playback, fader) = fader_at(1.0);
        let (done, callback) = flag();

        fader.fade(0.0, Duration::from_millis(500), Some(callback));
        sleep(Duration::from_millis(100)).await;
        assert!(fader.cancel().is_some());
        let frozen = playback.volume();

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(playback.volume(), frozen);
        assert!(!done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_is_clamped() {
        let (playback, fader) = fader_at(0.5);
        fader.fade(1.5, Duration::from_millis(50), None);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(playback.volume(), 1.0);

        fader.fade(-3.0, Duration::ZERO, None);
        assert_eq!(playback.volume(), 0.0);
    }
}
