//! CPAL-based fallback probe
//!
//! Used where no native peak-metering backend exists. CPAL can enumerate
//! output devices but cannot read another application's levels, so peak
//! queries report the probe as not ready and session listing is empty.

use super::blocking::BlockingQueries;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use lull_core::domain::config::ProbeConfig;
use lull_core::domain::probe::{AudioProbe, DuckTarget, ProbeError, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct CpalProbe {
    device_list_timeout: Duration,
    queries: BlockingQueries,
}

impl Default for CpalProbe {
    fn default() -> Self {
        Self::new(&ProbeConfig::default())
    }
}

impl CpalProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        info!("Initializing CPAL probe (device listing only)");
        Self {
            device_list_timeout: config.device_list_timeout(),
            queries: BlockingQueries::new(),
        }
    }
}

/// Output device names on the default host
fn output_device_names() -> Result<Vec<String>> {
    let host = cpal::default_host();
    debug!("Using audio host: {:?}", host.id());

    let devices = host
        .output_devices()
        .map_err(|e| ProbeError::Backend(e.to_string()))?;

    let mut names = Vec::new();
    for device in devices {
        #[allow(deprecated)]
        let name = device.name();
        match name {
            Ok(name) if !name.is_empty() => {
                debug!("Found device: {}", name);
                names.push(name);
            }
            Ok(_) => {}
            Err(e) => warn!("Skipping device due to error: {}", e),
        }
    }

    info!("Found {} output devices", names.len());
    Ok(names)
}

#[async_trait]
impl AudioProbe for CpalProbe {
    async fn list_devices(&self) -> Result<Vec<String>> {
        self.queries
            .run("device list", self.device_list_timeout, output_device_names)
            .await
    }

    async fn list_active_session_processes(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn measure_peak(&self, _target: &DuckTarget) -> Result<f32> {
        Err(ProbeError::NotReady(
            "peak metering is not available on this platform".to_string(),
        ))
    }
}
