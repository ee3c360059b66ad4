//! Native WASAPI audio probe
//!
//! Reads endpoint and session peak meters through the Windows audio session
//! API. Every query runs on a blocking thread with its own COM apartment and
//! is bounded by a timeout. A query that outlives its timeout keeps its kind
//! claimed until the COM call returns.
//!
//! When a session exposes no meter of its own the endpoint meter is used
//! instead, so a process target may read the whole device's peak.

use super::blocking::BlockingQueries;
use super::max_readable_peak;
use async_trait::async_trait;
use lull_core::domain::config::ProbeConfig;
use lull_core::domain::probe::{AudioProbe, DuckTarget, ProbeError, Result};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use windows::core::{Interface, PWSTR};
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::Media::Audio::Endpoints::IAudioMeterInformation;
use windows::Win32::Media::Audio::{
    eRender, AudioSessionStateActive, IAudioSessionControl2, IAudioSessionManager2, IMMDevice,
    IMMDeviceEnumerator, MMDeviceEnumerator, DEVICE_STATE_ACTIVE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED, STGM_READ,
};
use windows::Win32::System::Threading::{
    OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
};

pub struct WasapiProbe {
    device_list_timeout: Duration,
    session_list_timeout: Duration,
    peak_timeout: Duration,
    queries: BlockingQueries,
}

impl WasapiProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            device_list_timeout: config.device_list_timeout(),
            session_list_timeout: config.session_list_timeout(),
            peak_timeout: config.peak_timeout(),
            queries: BlockingQueries::new(),
        }
    }

    async fn blocking<T, F>(&self, key: String, limit: Duration, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.queries
            .run(key, limit, move || {
                let _com = ComGuard::new();
                query()
            })
            .await
    }
}

#[async_trait]
impl AudioProbe for WasapiProbe {
    async fn list_devices(&self) -> Result<Vec<String>> {
        self.blocking("device list".to_string(), self.device_list_timeout, || {
            let enumerator = device_enumerator()?;
            Ok(active_endpoints(&enumerator)?
                .into_iter()
                .map(|(name, _)| name)
                .collect())
        })
        .await
    }

    async fn list_active_session_processes(&self) -> Result<Vec<String>> {
        self.blocking(
            "session list".to_string(),
            self.session_list_timeout,
            list_sessions,
        )
        .await
    }

    async fn measure_peak(&self, target: &DuckTarget) -> Result<f32> {
        let key = format!("peak {target}");
        match target.clone() {
            DuckTarget::Device { name } => {
                self.blocking(key, self.peak_timeout, move || device_peak(&name))
                    .await
            }
            DuckTarget::Process { exe_names } => {
                self.blocking(key, self.peak_timeout, move || process_peak(&exe_names))
                    .await
            }
        }
    }
}

/// Per-thread COM initialization
struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    fn new() -> Self {
        // S_FALSE (already initialized) still needs a matching uninit
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        Self {
            initialized: hr.is_ok(),
        }
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { CoUninitialize() };
        }
    }
}

fn backend(context: &'static str) -> impl Fn(windows::core::Error) -> ProbeError {
    move |e| ProbeError::Backend(format!("{context}: {e}"))
}

fn device_enumerator() -> Result<IMMDeviceEnumerator> {
    unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
        .map_err(|e| ProbeError::NotReady(format!("device enumerator unavailable: {e}")))
}

/// Active render endpoints with their friendly names, in system order
fn active_endpoints(enumerator: &IMMDeviceEnumerator) -> Result<Vec<(String, IMMDevice)>> {
    let collection = unsafe { enumerator.EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE) }
        .map_err(backend("failed to enumerate endpoints"))?;
    let count = unsafe { collection.GetCount() }.map_err(backend("failed to count endpoints"))?;

    let mut endpoints = Vec::new();
    for i in 0..count {
        let Ok(device) = (unsafe { collection.Item(i) }) else {
            continue;
        };
        if let Some(name) = friendly_name(&device) {
            endpoints.push((name, device));
        }
    }
    Ok(endpoints)
}

fn friendly_name(device: &IMMDevice) -> Option<String> {
    unsafe {
        let store = device.OpenPropertyStore(STGM_READ).ok()?;
        let value = store.GetValue(&PKEY_Device_FriendlyName).ok()?;
        let name = value.to_string();
        (!name.is_empty()).then_some(name)
    }
}

fn endpoint_meter(device: &IMMDevice) -> Result<IAudioMeterInformation> {
    unsafe { device.Activate::<IAudioMeterInformation>(CLSCTX_ALL, None) }
        .map_err(backend("failed to activate endpoint meter"))
}

fn read_peak(meter: &IAudioMeterInformation) -> Result<f32> {
    unsafe { meter.GetPeakValue() }.map_err(backend("failed to read peak"))
}

/// Peak of the first endpoint whose name contains `name`; empty matches the first endpoint
fn device_peak(name: &str) -> Result<f32> {
    let enumerator = device_enumerator()?;
    let endpoint = active_endpoints(&enumerator)?
        .into_iter()
        .find(|(friendly, _)| name.is_empty() || friendly.contains(name));

    match endpoint {
        Some((friendly, device)) => {
            let peak = read_peak(&endpoint_meter(&device)?)?;
            debug!(device = %friendly, peak, "Endpoint peak");
            Ok(peak)
        }
        None => Err(ProbeError::TargetNotFound(name.to_string())),
    }
}

/// One audio session with the lowercase executable that owns it
struct Session {
    exe: String,
    control: IAudioSessionControl2,
    active: bool,
}

fn sessions_on(device: &IMMDevice) -> Result<Vec<Session>> {
    let manager = unsafe { device.Activate::<IAudioSessionManager2>(CLSCTX_ALL, None) }
        .map_err(backend("failed to activate session manager"))?;
    let sessions = unsafe { manager.GetSessionEnumerator() }
        .map_err(backend("failed to enumerate sessions"))?;
    let count = unsafe { sessions.GetCount() }.map_err(backend("failed to count sessions"))?;

    let mut found = Vec::new();
    for i in 0..count {
        let Ok(session) = (unsafe { sessions.GetSession(i) }) else {
            continue;
        };
        let Ok(control) = session.cast::<IAudioSessionControl2>() else {
            continue;
        };
        let pid = match unsafe { control.GetProcessId() } {
            Ok(pid) if pid != 0 => pid,
            _ => continue,
        };
        let Some(exe) = process_exe_name(pid) else {
            continue;
        };
        let active = unsafe { session.GetState() }
            .map(|state| state == AudioSessionStateActive)
            .unwrap_or(false);
        found.push(Session {
            exe,
            control,
            active,
        });
    }
    Ok(found)
}

fn list_sessions() -> Result<Vec<String>> {
    let enumerator = device_enumerator()?;
    let mut names = BTreeSet::new();
    for (friendly, device) in active_endpoints(&enumerator)? {
        match sessions_on(&device) {
            Ok(sessions) => names.extend(sessions.into_iter().filter(|s| s.active).map(|s| s.exe)),
            Err(e) => debug!(device = %friendly, error = %e, "Skipping endpoint"),
        }
    }
    Ok(names.into_iter().collect())
}

/// Maximum peak over every session owned by one of `exe_names`, on any endpoint
fn process_peak(exe_names: &BTreeSet<String>) -> Result<f32> {
    let enumerator = device_enumerator()?;
    let mut readings = Vec::new();

    for (friendly, device) in active_endpoints(&enumerator)? {
        let sessions = match sessions_on(&device) {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!(device = %friendly, error = %e, "Skipping endpoint");
                continue;
            }
        };

        for session in sessions.iter().filter(|s| exe_names.contains(&s.exe)) {
            let reading = session_peak(&device, session);
            match &reading {
                Ok(peak) => debug!(exe = %session.exe, device = %friendly, peak, "Session peak"),
                Err(e) => debug!(exe = %session.exe, device = %friendly, error = %e, "Skipping session"),
            }
            readings.push(reading);
        }
    }

    max_readable_peak(readings)
}

/// The session's own meter, or the endpoint meter when it has none
fn session_peak(device: &IMMDevice, session: &Session) -> Result<f32> {
    let meter = match session.control.cast::<IAudioMeterInformation>() {
        Ok(meter) => meter,
        Err(_) => endpoint_meter(device)?,
    };
    read_peak(&meter)
}

/// Lowercase executable file name of a process
fn process_exe_name(pid: u32) -> Option<String> {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid).ok()?;

        let mut buf = [0u16; 1024];
        let mut len = buf.len() as u32;
        let queried = QueryFullProcessImageNameW(
            handle,
            PROCESS_NAME_WIN32,
            PWSTR(buf.as_mut_ptr()),
            &mut len,
        );
        let _ = CloseHandle(handle);
        queried.ok()?;

        let path = String::from_utf16_lossy(&buf[..len as usize]);
        Path::new(&path)
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
    }
}
