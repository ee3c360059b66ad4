//! Lull core: the ducking decision engine and its domain types

pub mod domain;

pub use domain::*;
