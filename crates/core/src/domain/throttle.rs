//! Probe throttling
//!
//! Spawning a probe can take the better part of a second while the poll loop
//! fires every few hundred milliseconds. The throttle keeps at most one probe
//! per query in flight; callers arriving while it runs get the last completed
//! answer immediately instead of queuing behind it.

use crate::domain::probe::{AudioProbe, DuckTarget, ProbeResult};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

#[derive(Debug)]
struct Slot<V> {
    in_flight: bool,
    last: Option<V>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            in_flight: false,
            last: None,
        }
    }
}

/// Single-slot request coalescer: at most one call per key in flight,
/// replace-on-complete cache of the last value.
#[derive(Debug)]
pub struct Coalescer<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        // A panic while holding this lock cannot leave a slot half-written
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `call` for `key` unless one is already outstanding.
    ///
    /// When busy, returns the last completed value for `key`, or `idle` if none
    /// has completed yet. Never waits on the outstanding call.
    pub async fn run<F, Fut>(&self, key: K, idle: V, call: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        {
            let mut slots = self.slots();
            let slot = slots.entry(key.clone()).or_default();
            if slot.in_flight {
                return slot.last.clone().unwrap_or(idle);
            }
            slot.in_flight = true;
        }

        let mut guard = InFlight {
            owner: self,
            key: Some(key),
        };
        let value = call().await;
        guard.complete(value.clone());
        value
    }

    /// Whether a call for `key` is currently outstanding
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.slots().get(key).map(|s| s.in_flight).unwrap_or(false)
    }

    /// Last completed value for `key`
    pub fn last(&self, key: &K) -> Option<V> {
        self.slots().get(key).and_then(|s| s.last.clone())
    }
}

impl<K, V> Default for Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the in-flight flag even if the calling future is dropped mid-probe
struct InFlight<'a, K: Eq + Hash + Clone, V: Clone> {
    owner: &'a Coalescer<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> InFlight<'_, K, V> {
    fn complete(&mut self, value: V) {
        if let Some(key) = self.key.take() {
            let mut slots = self.owner.slots();
            let slot = slots.entry(key).or_default();
            slot.in_flight = false;
            slot.last = Some(value);
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for InFlight<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Some(slot) = self.owner.slots().get_mut(&key) {
                slot.in_flight = false;
            }
        }
    }
}

/// Throttled, error-normalizing front of an [`AudioProbe`].
///
/// This is the only component that talks to the probe. Probe failures leave
/// here as values: silent [`ProbeResult`]s with a reason, or empty lists.
pub struct ProbeThrottle {
    probe: Arc<dyn AudioProbe>,
    silence_threshold: f32,
    devices: Coalescer<(), Vec<String>>,
    sessions: Coalescer<(), Vec<String>>,
    peaks: Coalescer<DuckTarget, ProbeResult>,
}

impl ProbeThrottle {
    pub fn new(probe: Arc<dyn AudioProbe>, silence_threshold: f32) -> Self {
        Self {
            probe,
            silence_threshold,
            devices: Coalescer::new(),
            sessions: Coalescer::new(),
            peaks: Coalescer::new(),
        }
    }

    pub fn silence_threshold(&self) -> f32 {
        self.silence_threshold
    }

    /// Active playback device names; empty on failure
    pub async fn list_devices(&self) -> Vec<String> {
        let probe = Arc::clone(&self.probe);
        self.devices
            .run((), Vec::new(), || async move {
                probe.list_devices().await.unwrap_or_else(|e| {
                    debug!(error = %e, "Device enumeration failed");
                    Vec::new()
                })
            })
            .await
    }

    /// Executables with an active audio session; empty on failure
    pub async fn list_sessions(&self) -> Vec<String> {
        let probe = Arc::clone(&self.probe);
        self.sessions
            .run((), Vec::new(), || async move {
                probe.list_active_session_processes().await.unwrap_or_else(|e| {
                    debug!(error = %e, "Session enumeration failed");
                    Vec::new()
                })
            })
            .await
    }

    /// Peak measurement for one target
    pub async fn measure(&self, target: &DuckTarget) -> ProbeResult {
        let probe = Arc::clone(&self.probe);
        let threshold = self.silence_threshold;
        let owned = target.clone();
        if self.peaks.is_in_flight(target) {
            trace!(%target, "Probe busy, reusing last result");
        }
        self.peaks
            .run(target.clone(), ProbeResult::default(), || async move {
                let outcome = probe.measure_peak(&owned).await;
                if let Err(e) = &outcome {
                    debug!(target = %owned, error = %e, "Peak probe failed");
                }
                ProbeResult::from_outcome(outcome, threshold)
            })
            .await
    }

    /// Last completed measurement for a target, if any
    pub fn last_result(&self, target: &DuckTarget) -> Option<ProbeResult> {
        self.peaks.last(target)
    }
}
