//! Timed queries on blocking threads
//!
//! A timeout stops the wait but cannot stop the thread. Each query key stays
//! claimed until its closure has actually returned, and a new query for a
//! claimed key is refused instead of stacking another thread behind a hung
//! driver.

use lull_core::domain::probe::{ProbeError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

#[derive(Default)]
pub struct BlockingQueries {
    live: Arc<Mutex<HashSet<String>>>,
}

/// Releases a claimed key when the blocking closure is dropped
struct Claim {
    live: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

impl BlockingQueries {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, key: String) -> Option<Claim> {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if !live.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            live: self.live.clone(),
            key,
        })
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// Run `query` on a blocking thread, waiting at most `limit`
    pub async fn run<T, F>(&self, key: impl Into<String>, limit: Duration, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let key = key.into();
        let Some(claim) = self.claim(key.clone()) else {
            debug!(%key, "Previous blocking query still running");
            return Err(ProbeError::NotReady(format!(
                "previous {key} query is still running"
            )));
        };

        let task = tokio::task::spawn_blocking(move || {
            let _claim = claim;
            query()
        });
        match timeout(limit, task).await {
            Err(_) => {
                debug!(%key, ?limit, "Blocking query timed out");
                Err(ProbeError::Timeout(limit))
            }
            Ok(Err(e)) => Err(ProbeError::Backend(format!("{key} query failed: {e}"))),
            Ok(Ok(result)) => result,
        }
    }
}
