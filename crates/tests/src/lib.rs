//! Cross-crate integration tests for Lull

#[cfg(test)]
mod ducking_integration;
