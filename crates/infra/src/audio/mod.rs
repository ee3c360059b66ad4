//! Platform-specific audio probe implementations
//!
//! - Windows: native WASAPI endpoint and session meters
//! - Any platform: an external helper executable speaking the line protocol
//! - Elsewhere: CPAL, which can list devices but not meter them

pub mod blocking;
pub mod cpal_backend;
pub mod helper;
#[cfg(windows)]
pub mod wasapi;

pub use cpal_backend::CpalProbe;
pub use helper::HelperProbe;
#[cfg(windows)]
pub use wasapi::WasapiProbe;

use lull_core::domain::config::ProbeConfig;
use lull_core::domain::probe::{AudioProbe, Result};
use std::sync::Arc;
use tracing::info;

/// Pick the probe for this machine.
///
/// A configured helper path always wins; otherwise the native backend.
pub fn system_probe(config: &ProbeConfig) -> Arc<dyn AudioProbe> {
    if let Some(path) = &config.helper_path {
        info!(path = %path.display(), "Using external audio helper");
        return Arc::new(HelperProbe::new(path.clone(), config));
    }

    #[cfg(windows)]
    {
        info!("Using WASAPI audio probe");
        Arc::new(WasapiProbe::new(config))
    }

    #[cfg(not(windows))]
    {
        Arc::new(CpalProbe::new(config))
    }
}

/// Loudest successful reading; an error only when nothing could be read
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn max_readable_peak(readings: impl IntoIterator<Item = Result<f32>>) -> Result<f32> {
    let mut loudest: Option<f32> = None;
    let mut failure = None;
    for reading in readings {
        match reading {
            Ok(peak) => loudest = Some(loudest.map_or(peak, |max| max.max(peak))),
            Err(e) => failure = Some(e),
        }
    }
    match (loudest, failure) {
        (Some(peak), _) => Ok(peak),
        (None, Some(e)) => Err(e),
        (None, None) => Ok(0.0),
    }
}
