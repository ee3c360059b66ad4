//! Lull infrastructure: platform audio probes

pub mod audio;

pub use audio::system_probe;
