//! Configuration management for Lull
//!
//! This module provides:
//! - Configuration structs for ducking, probing, and playback
//! - TOML load/save with validation
//! - A config manager with factory defaults and corrupt-file recovery
//! - Hot-reload support via file system watcher

use crate::domain::probe::{targets_for, DuckMode, DuckTarget, SILENCE_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to watch and how the engine reacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuckingConfig {
    /// Ducking toggle
    pub enabled: bool,

    /// Device or exe mode
    pub mode: DuckMode,

    /// Output device names (substring match) for device mode
    pub devices: Vec<String>,

    /// Executable names for exe mode
    pub exes: Vec<String>,

    /// Poll period in milliseconds
    pub poll_interval_ms: u64,

    /// Consecutive silent polls required before release
    pub silence_checks: u32,

    /// Fade-out when competing audio starts
    pub duck_fade_ms: u64,

    /// Fade-in after release
    pub release_fade_ms: u64,

    /// Fade-in when ducking is switched off mid-duck
    pub disable_release_fade_ms: u64,
}

impl Default for DuckingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DuckMode::Device,
            devices: Vec::new(),
            exes: Vec::new(),
            poll_interval_ms: 400,
            silence_checks: 8,
            duck_fade_ms: 300,
            release_fade_ms: 15_000,
            disable_release_fade_ms: 500,
        }
    }
}

impl DuckingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn duck_fade(&self) -> Duration {
        Duration::from_millis(self.duck_fade_ms)
    }

    pub fn release_fade(&self) -> Duration {
        Duration::from_millis(self.release_fade_ms)
    }

    pub fn disable_release_fade(&self) -> Duration {
        Duration::from_millis(self.disable_release_fade_ms)
    }

    /// Names configured for the active mode
    pub fn active_names(&self) -> &[String] {
        match self.mode {
            DuckMode::Device => &self.devices,
            DuckMode::Exe => &self.exes,
        }
    }

    /// Targets to poll for the active mode; empty means no polling
    pub fn targets(&self) -> Vec<DuckTarget> {
        targets_for(self.mode, self.active_names())
    }

    /// Replace the name list for `mode` and make it the active mode
    pub fn set_targets(&mut self, mode: DuckMode, names: Vec<String>) {
        self.mode = mode;
        match mode {
            DuckMode::Device => self.devices = names,
            DuckMode::Exe => self.exes = names,
        }
    }
}

/// Audio probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// External helper executable; native backend when unset
    pub helper_path: Option<PathBuf>,

    /// Peak level above which a target counts as audible
    pub silence_threshold: f32,

    pub device_list_timeout_ms: u64,

    pub session_list_timeout_ms: u64,

    pub peak_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            helper_path: None,
            silence_threshold: SILENCE_THRESHOLD,
            device_list_timeout_ms: 6_000,
            session_list_timeout_ms: 3_000,
            peak_timeout_ms: 2_000,
        }
    }
}

impl ProbeConfig {
    pub fn device_list_timeout(&self) -> Duration {
        Duration::from_millis(self.device_list_timeout_ms)
    }

    pub fn session_list_timeout(&self) -> Duration {
        Duration::from_millis(self.session_list_timeout_ms)
    }

    pub fn peak_timeout(&self) -> Duration {
        Duration::from_millis(self.peak_timeout_ms)
    }
}

/// Playback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Nominal volume in [0, 1]
    pub volume: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { volume: 0.7 }
    }
}

/// Complete Lull configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LullConfig {
    pub ducking: DuckingConfig,
    pub probe: ProbeConfig,
    pub playback: PlaybackConfig,
}

impl LullConfig {
    /// Parse a config from a TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Write this config as pretty TOML, creating the parent directory
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ducking.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".to_string()));
        }
        if self.ducking.silence_checks == 0 {
            return Err(ConfigError::Invalid("silence_checks must be positive".to_string()));
        }
        let threshold = self.probe.silence_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "silence_threshold must be a non-negative number, got {threshold}"
            )));
        }
        let volume = self.playback.volume;
        if !(0.0..=1.0).contains(&volume) {
            return Err(ConfigError::Invalid(format!(
                "volume must be within 0..=1, got {volume}"
            )));
        }
        for (name, ms) in [
            ("device_list_timeout_ms", self.probe.device_list_timeout_ms),
            ("session_list_timeout_ms", self.probe.session_list_timeout_ms),
            ("peak_timeout_ms", self.probe.peak_timeout_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Watches the config file and broadcasts its path on every write
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
    config_tx: broadcast::Sender<PathBuf>,
}

impl ConfigWatcher {
    /// Watch a single config file for changes
    pub async fn new(config_path: PathBuf) -> Result<Self> {
        use notify::Watcher;

        let (config_tx, _config_rx) = broadcast::channel(32);

        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir).await?;

        let file_name = config_path.file_name().map(|n| n.to_os_string());
        let tx_clone = config_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) {
                    for path in event.paths {
                        if path.file_name().map(|n| n.to_os_string()) == file_name {
                            if let Err(e) = tx_clone.send(path) {
                                debug!("No listener for config change event: {}", e);
                            }
                        }
                    }
                }
            }
        })?;

        watcher.watch(&dir, notify::RecursiveMode::NonRecursive)?;

        info!(
            path = %config_path.display(),
            "Config watcher started"
        );

        Ok(Self {
            _watcher: watcher,
            config_tx,
        })
    }

    /// Subscribe to config change events
    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.config_tx.subscribe()
    }
}

/// Configuration manager for the main Lull config
///
/// Manages the configuration file at `~/.config/lull/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager
    ///
    /// # Arguments
    /// * `config_dir` - Configuration directory path (e.g., `~/.config/lull`)
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");

        Self {
            config_dir,
            config_path,
        }
    }

    /// Manage an explicit config file path
    pub fn with_path(config_path: PathBuf) -> Self {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/lull` on Linux, `%APPDATA%\lull` on Windows
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("lull"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    /// Get the config file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, returns factory default.
    /// If the config file is corrupt, logs an error and returns factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> LullConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = LullConfig::default();

            // Save the factory default for next time
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }

            return config;
        }

        match LullConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                // Backup the corrupt config
                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                LullConfig::default()
            }
        }
    }

    /// Load without touching the file system on failure
    pub async fn reload(&self) -> Result<LullConfig> {
        LullConfig::load_from_file(&self.config_path).await
    }

    /// Save configuration to file
    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &LullConfig) -> Result<()> {
        config.validate()?;
        fs::create_dir_all(&self.config_dir).await?;

        config.save_to_file(&self.config_path).await
    }

    /// Delete the config file if present
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        if self.config_path.exists() {
            fs::remove_file(&self.config_path).await?;
            info!(
                path = %self.config_path.display(),
                "Configuration cleared"
            );
        }

        Ok(())
    }

    /// Whether the config file is on disk
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
