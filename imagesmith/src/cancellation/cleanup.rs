//! Cleanup registry for build resources.
//!
//! Resources are registered as they are acquired and released in LIFO
//! order, so the guest is destroyed before the artifact server it was
//! booted against is stopped.

use crate::errors::{TeardownError, TeardownReport};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Type alias for async cleanup callbacks.
pub type CleanupCallback = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Registry for cleanup callbacks executed in LIFO order.
#[derive(Default)]
pub struct CleanupRegistry {
    callbacks: Mutex<Vec<(String, CleanupCallback)>>,
}

impl CleanupRegistry {
    /// Creates a new cleanup registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup callback under a resource name.
    pub fn register<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let boxed: CleanupCallback = Box::new(move || Box::pin(callback()));
        self.callbacks.lock().push((name.into(), boxed));
    }

    /// Removes a callback without running it.
    ///
    /// Used when a resource changed owner (e.g. the guest became the
    /// artifact). Returns true if a callback was removed.
    pub fn unregister_by_name(&self, name: &str) -> bool {
        let mut callbacks = self.callbacks.lock();
        let initial_len = callbacks.len();
        callbacks.retain(|(n, _)| n != name);
        callbacks.len() < initial_len
    }

    /// Returns true if a callback with this name is pending.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.callbacks.lock().iter().any(|(n, _)| n == name)
    }

    /// Returns the number of pending cleanup callbacks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Runs all cleanup callbacks in LIFO order.
    ///
    /// Each callback gets its own `per_callback` timeout. Failures are
    /// collected and do not stop the remaining callbacks. The registry is
    /// empty afterwards.
    pub async fn run_all(&self, per_callback: Duration) -> TeardownReport {
        let callbacks: Vec<_> = std::mem::take(&mut *self.callbacks.lock());
        let mut report = TeardownReport::default();

        for (name, callback) in callbacks.into_iter().rev() {
            match timeout(per_callback, callback()).await {
                Ok(Ok(())) => report.released.push(name),
                Ok(Err(reason)) => {
                    warn!(resource = %name, %reason, "Cleanup failed");
                    report.failures.push(TeardownError::new(name, reason));
                }
                Err(_) => {
                    let reason = format!("timed out after {}s", per_callback.as_secs_f64());
                    warn!(resource = %name, %reason, "Cleanup failed");
                    report.failures.push(TeardownError::new(name, reason));
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}
