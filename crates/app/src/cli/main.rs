//! Lull CLI Application

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use lull_core::domain::config::{ConfigManager, ConfigWatcher, LullConfig};
use lull_core::domain::engine::{DuckingEngine, DuckingEvent};
use lull_core::domain::playback::InMemoryPlayback;
use lull_core::domain::probe::{AudioProbe, DuckTarget, ProbeResult};
use lull_infra::system_probe;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lull")]
#[command(about = "Ambient music ducking: quiets playback while other audio is active", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List active playback devices
    Devices,
    /// List programs holding an active audio session
    Sessions,
    /// Measure the current peak of a device or set of programs
    Peak {
        /// Device name (substring of the friendly name)
        #[arg(long, conflicts_with = "exe")]
        device: Option<String>,

        /// Executable names, comma separated
        #[arg(long, value_delimiter = ',')]
        exe: Vec<String>,
    },
    /// Run the ducking engine until interrupted, following config changes
    Monitor,
    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the factory default config
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(ConfigManager::default_config_dir()?),
    };

    match cli.command {
        Command::Devices => {
            let engine = idle_engine(&manager).await;
            print_list(&engine.list_audio_devices().await, cli.json)
        }
        Command::Sessions => {
            let engine = idle_engine(&manager).await;
            print_list(&engine.list_audio_sessions().await, cli.json)
        }
        Command::Peak { device, exe } => peak(&manager, device, exe, cli.json).await,
        Command::Monitor => monitor(&manager, cli.json).await,
        Command::Config { action } => config(&manager, action, cli.json).await,
    }
}

/// Engine with nothing to watch, used for the picker queries
async fn idle_engine(manager: &ConfigManager) -> DuckingEngine {
    let config = manager.load().await;
    let probe = system_probe(&config.probe);
    DuckingEngine::new(probe, Arc::new(InMemoryPlayback::default()), &config)
}

fn print_list(items: &[String], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
    } else if items.is_empty() {
        println!("(none)");
    } else {
        for item in items {
            println!("{item}");
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn peak(
    manager: &ConfigManager,
    device: Option<String>,
    exe: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    let target = match device {
        Some(name) => DuckTarget::device(name),
        None if !exe.is_empty() => DuckTarget::process(&exe),
        None => bail!("pass --device <name> or --exe <names>"),
    };

    let config = manager.load().await;
    let probe = system_probe(&config.probe);
    let outcome = probe.measure_peak(&target).await;
    let result = ProbeResult::from_outcome(outcome, config.probe.silence_threshold);

    if json {
        return print_json(&result);
    }
    match &result.error {
        Some(reason) => println!("{target}: no reading ({reason})"),
        None => println!(
            "{target}: peak {:.4} ({})",
            result.peak_level,
            if result.is_playing { "playing" } else { "silent" }
        ),
    }
    Ok(())
}

async fn monitor(manager: &ConfigManager, json: bool) -> anyhow::Result<()> {
    let config = manager.load().await;
    let probe = system_probe(&config.probe);
    let playback = Arc::new(InMemoryPlayback::new(config.playback.volume));
    let engine = DuckingEngine::new(probe, playback, &config);
    let mut events = engine.subscribe();

    if !config.ducking.enabled {
        warn!("Ducking is disabled in the config; waiting for changes");
    } else if config.ducking.targets().is_empty() {
        warn!(mode = %config.ducking.mode, "No duck targets configured; waiting for changes");
    }
    engine.reconfigure(config.ducking.clone());

    let watcher = ConfigWatcher::new(manager.config_path().to_path_buf())
        .await
        .context("failed to watch config file")?;
    let mut changes = watcher.subscribe();
    let mut probe_config = config.probe;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Monitoring; press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => report(&event, json)?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed ducking events"),
                Err(RecvError::Closed) => break,
            },
            change = changes.recv() => match change {
                Ok(_) | Err(RecvError::Lagged(_)) => match manager.reload().await {
                    Ok(updated) => {
                        info!("Config changed, reconfiguring");
                        if updated.probe != probe_config {
                            warn!("Probe settings changed; restart to apply them");
                            probe_config = updated.probe;
                        }
                        engine.set_volume(updated.playback.volume);
                        engine.reconfigure(updated.ducking);
                    }
                    Err(e) => warn!(error = %e, "Ignoring invalid config change"),
                },
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.stop();
    if json {
        print_json(&engine.ducking_state())?;
    } else if let Some(reason) = engine.last_error() {
        info!(%reason, "Last probe error");
    }
    Ok(())
}

fn report(event: &DuckingEvent, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(event);
    }
    match event {
        DuckingEvent::Engaged { peak_level } => println!("ducking (peak {peak_level:.4})"),
        DuckingEvent::Released { forced: false } => println!("released"),
        DuckingEvent::Released { forced: true } => println!("released (ducking turned off)"),
    }
    Ok(())
}

async fn config(manager: &ConfigManager, action: ConfigAction, json: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if manager.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    manager.config_path().display()
                );
            }
            manager.save(&LullConfig::default()).await?;
            println!("wrote {}", manager.config_path().display());
        }
        ConfigAction::Show => {
            let config = manager.load().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
        ConfigAction::Path => println!("{}", manager.config_path().display()),
    }
    Ok(())
}
