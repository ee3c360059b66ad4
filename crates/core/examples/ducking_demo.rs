//! Example demonstrating the ducking engine against a simulated audio source
//!
//! Run with: cargo run --package lull-core --example ducking_demo

use async_trait::async_trait;
use lull_core::domain::config::{ConfigManager, LullConfig};
use lull_core::domain::engine::{DuckingEngine, DuckingEvent};
use lull_core::domain::playback::{InMemoryPlayback, Playback};
use lull_core::domain::probe::{AudioProbe, DuckMode, DuckTarget, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A "game" that plays sound for one second out of every four
struct IntermittentGame {
    started: tokio::time::Instant,
    polls: AtomicU32,
}

#[async_trait]
impl AudioProbe for IntermittentGame {
    async fn list_devices(&self) -> Result<Vec<String>> {
        Ok(vec!["Demo Speakers".to_string()])
    }

    async fn list_active_session_processes(&self) -> Result<Vec<String>> {
        Ok(vec!["game.exe".to_string()])
    }

    async fn measure_peak(&self, _target: &DuckTarget) -> Result<f32> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_millis() % 4000;
        Ok(if elapsed < 1000 { 0.4 } else { 0.0 })
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("lull_core=debug,info")
        .init();

    println!("=== Lull Ducking Demo ===\n");

    // 1. Write and reload a config with fast timings
    println!("1. Creating configuration...");
    let dir = tempfile::tempdir()?;
    let manager = ConfigManager::new(dir.path().to_path_buf());
    let mut config = LullConfig::default();
    config.ducking.enabled = true;
    config.ducking.set_targets(DuckMode::Exe, vec!["Game.exe".to_string()]);
    config.ducking.poll_interval_ms = 200;
    config.ducking.silence_checks = 5;
    config.ducking.release_fade_ms = 1500;
    manager.save(&config).await?;
    let config = manager.reload().await?;
    println!("   ✓ Saved and reloaded {}", manager.config_path().display());

    // 2. Start the engine
    println!("\n2. Starting engine (watching {:?})...", config.ducking.exes);
    let probe = Arc::new(IntermittentGame {
        started: tokio::time::Instant::now(),
        polls: AtomicU32::new(0),
    });
    let playback = Arc::new(InMemoryPlayback::new(config.playback.volume));
    let engine = DuckingEngine::new(probe.clone(), playback.clone(), &config);
    let mut events = engine.subscribe();
    engine.reconfigure(config.ducking.clone());

    // 3. Watch a few cycles
    println!("\n3. Events:");
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Ok(event) = events.recv() => match event {
                DuckingEvent::Engaged { peak_level } => {
                    println!("   ↓ ducking (peak {:.2})", peak_level)
                }
                DuckingEvent::Released { .. } => println!("   ↑ released"),
            },
        }
    }

    // 4. Final state
    engine.stop();
    println!("\n4. Final state:");
    println!("   {:?}", engine.ducking_state());
    println!("   volume {:.2}, {} polls", playback.volume(), probe.polls.load(Ordering::Relaxed));

    println!("\n=== Demo Complete ===");
    Ok(())
}
