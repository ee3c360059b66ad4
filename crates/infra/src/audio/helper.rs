//! Audio probe backed by an external helper executable
//!
//! The helper is spawned once per query and answers on stdout:
//!
//! | arguments | output |
//! |---|---|
//! | `--list-devices` | one device friendly name per line |
//! | `--list-sessions` | one executable name per line |
//! | `<device-substring>` | a single peak value |
//! | `--exe <name>...` | a single peak value, the maximum over matching sessions |
//!
//! Single-value queries use `-1` for "nothing matched" and `-99` for an
//! internal helper failure.

use async_trait::async_trait;
use lull_core::domain::config::ProbeConfig;
use lull_core::domain::probe::{normalize_exe_name, AudioProbe, DuckTarget, ProbeError, Result};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Sentinel: no endpoint or session matched
const NO_MATCH: f32 = -1.0;

/// Sentinel: the helper failed internally
const INTERNAL_ERROR: f32 = -99.0;

pub struct HelperProbe {
    path: PathBuf,
    device_list_timeout: Duration,
    session_list_timeout: Duration,
    peak_timeout: Duration,
    ready: AtomicBool,
    resolved: Mutex<Option<PathBuf>>,
}

impl HelperProbe {
    pub fn new(path: impl Into<PathBuf>, config: &ProbeConfig) -> Self {
        Self {
            path: path.into(),
            device_list_timeout: config.device_list_timeout(),
            session_list_timeout: config.session_list_timeout(),
            peak_timeout: config.peak_timeout(),
            ready: AtomicBool::new(true),
            resolved: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-checked on every call so a helper installed later is picked up
    async fn check_ready(&self) -> Result<PathBuf> {
        let found = self.resolve().await;
        self.set_ready(found.is_some());
        found.ok_or_else(|| {
            ProbeError::NotReady(format!("helper not found at {}", self.path.display()))
        })
    }

    /// Executable to spawn: a bare name is looked up on PATH once, anything
    /// else is used as given. A cached location that disappears is looked up again.
    async fn resolve(&self) -> Option<PathBuf> {
        let cached = self.cached();
        if let Some(path) = cached {
            if is_file(&path).await {
                return Some(path);
            }
            self.cache(None);
        }

        let found = if is_bare_name(&self.path) {
            let name = self.path.clone();
            tokio::task::spawn_blocking(move || which::which(name).ok())
                .await
                .ok()
                .flatten()
        } else if is_file(&self.path).await {
            Some(self.path.clone())
        } else {
            None
        };
        if let Some(path) = &found {
            debug!(path = %path.display(), "Resolved audio helper");
            self.cache(Some(path.clone()));
        }
        found
    }

    fn cached(&self) -> Option<PathBuf> {
        self.resolved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn cache(&self, path: Option<PathBuf>) {
        *self.resolved.lock().unwrap_or_else(|e| e.into_inner()) = path;
    }

    fn set_ready(&self, ready: bool) {
        let was_ready = self.ready.swap(ready, Ordering::SeqCst);
        if ready && !was_ready {
            info!(path = %self.path.display(), "Audio helper ready");
        } else if !ready && was_ready {
            warn!(path = %self.path.display(), "Audio helper unavailable");
        }
    }

    async fn run(&self, args: &[&str], limit: Duration) -> Result<String> {
        let program = self.check_ready().await?;

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let output = match timeout(limit, cmd.output()).await {
            Err(_) => {
                debug!(?args, "Audio helper timed out");
                return Err(ProbeError::Timeout(limit));
            }
            Ok(Err(e)) => {
                self.cache(None);
                self.set_ready(false);
                return Err(ProbeError::NotReady(format!("failed to run helper: {e}")));
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() && stdout.trim().is_empty() {
            return Err(ProbeError::Backend(format!("helper exited with {}", output.status)));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl AudioProbe for HelperProbe {
    async fn list_devices(&self) -> Result<Vec<String>> {
        let stdout = self.run(&["--list-devices"], self.device_list_timeout).await?;
        parse_list(&stdout)
    }

    async fn list_active_session_processes(&self) -> Result<Vec<String>> {
        let stdout = self.run(&["--list-sessions"], self.session_list_timeout).await?;
        let mut names: Vec<String> = parse_list(&stdout)?
            .iter()
            .filter_map(|n| normalize_exe_name(n))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn measure_peak(&self, target: &DuckTarget) -> Result<f32> {
        match target {
            DuckTarget::Device { name } => {
                let stdout = self.run(&[name.as_str()], self.peak_timeout).await?;
                match parse_peak(&stdout)? {
                    Some(peak) => Ok(peak),
                    None => Err(ProbeError::TargetNotFound(name.clone())),
                }
            }
            DuckTarget::Process { exe_names } => {
                if exe_names.is_empty() {
                    return Ok(0.0);
                }
                let mut args = vec!["--exe"];
                args.extend(exe_names.iter().map(String::as_str));
                let stdout = self.run(&args, self.peak_timeout).await?;
                // Target not running is normal
                Ok(parse_peak(&stdout)?.unwrap_or(0.0))
            }
        }
    }
}

/// A single plain component such as `lull-helper`
fn is_bare_name(path: &Path) -> bool {
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Non-empty trimmed lines; a lone `-99` is a helper failure
fn parse_list(stdout: &str) -> Result<Vec<String>> {
    let lines: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if lines.len() == 1 && lines[0] == "-99" {
        return Err(ProbeError::Backend("helper reported an internal error".to_string()));
    }
    Ok(lines)
}

/// Parse a single peak value; `None` for the no-match sentinel
fn parse_peak(stdout: &str) -> Result<Option<f32>> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ProbeError::MalformedOutput("empty output".to_string()))?;

    let value: f32 = line
        .parse()
        .map_err(|_| ProbeError::MalformedOutput(format!("not a number: {line:?}")))?;

    if value.is_nan() {
        Err(ProbeError::MalformedOutput(format!("not a number: {line:?}")))
    } else if value == INTERNAL_ERROR {
        Err(ProbeError::Backend("helper reported an internal error".to_string()))
    } else if value == NO_MATCH {
        Ok(None)
    } else if value < 0.0 || value.is_infinite() {
        Err(ProbeError::MalformedOutput(format!("peak out of range: {line:?}")))
    } else {
        Ok(Some(value))
    }
}
