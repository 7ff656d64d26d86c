//! Scoped ownership of the resources one build creates.

use crate::cancellation::CleanupRegistry;
use crate::driver::{GuestDriver, GuestInstance};
use crate::errors::TeardownReport;
use crate::server::ArtifactServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry name of the artifact server.
pub const SERVER_RESOURCE: &str = "artifact-server";
/// Registry name of the guest.
pub const GUEST_RESOURCE: &str = "guest";

/// Holds the artifact server and the guest until teardown.
///
/// Resources are released in reverse order of acquisition: the guest is
/// destroyed before the server it booted from is stopped. [`release`]
/// runs at most once. A scope dropped without being released (its build
/// future was dropped) releases in a task spawned on the current runtime.
///
/// [`release`]: ResourceScope::release
#[derive(Debug)]
pub struct ResourceScope {
    registry: CleanupRegistry,
    per_resource: Duration,
    released: bool,
}

impl ResourceScope {
    /// Creates an empty scope; each release step gets `per_resource`.
    #[must_use]
    pub fn new(per_resource: Duration) -> Self {
        Self {
            registry: CleanupRegistry::new(),
            per_resource,
            released: false,
        }
    }

    /// Takes ownership of a running artifact server.
    pub fn hold_server(&self, server: ArtifactServer) {
        debug!(port = server.port(), "Artifact server held by build scope");
        self.registry.register(SERVER_RESOURCE, move || async move {
            let mut server = server;
            server.stop().await.map_err(|e| e.to_string())
        });
    }

    /// Takes responsibility for destroying `guest`.
    pub fn hold_guest(&self, driver: Arc<dyn GuestDriver>, guest: GuestInstance) {
        debug!(guest_id = %guest.id, "Guest held by build scope");
        self.registry.register(GUEST_RESOURCE, move || async move {
            info!(guest_id = %guest.id, "Destroying guest");
            driver.destroy(&guest).await.map_err(|e| e.to_string())
        });
    }

    /// Gives up the guest without destroying it; it became the artifact.
    pub fn forget_guest(&self) -> bool {
        self.registry.unregister_by_name(GUEST_RESOURCE)
    }

    /// Returns true if `resource` is still waiting for teardown.
    #[must_use]
    pub fn holds(&self, resource: &str) -> bool {
        self.registry.contains(resource)
    }

    /// Returns true once [`release`](Self::release) has run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Releases everything still held.
    ///
    /// Failures are collected in the report and logged as warnings. A
    /// second call releases nothing and returns an empty report.
    pub async fn release(&mut self) -> TeardownReport {
        if self.released {
            debug!("Build scope already released");
            return TeardownReport::default();
        }
        self.released = true;

        let report = self.registry.run_all(self.per_resource).await;
        if !report.is_noop() {
            info!(
                released = ?report.released,
                failures = report.failures.len(),
                "Teardown finished"
            );
        }
        report
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if self.released || self.registry.pending_count() == 0 {
            return;
        }
        let registry = std::mem::take(&mut self.registry);
        let per_resource = self.per_resource;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    pending = registry.pending_count(),
                    "Build abandoned before teardown; releasing in the background"
                );
                handle.spawn(async move {
                    let report = registry.run_all(per_resource).await;
                    info!(released = ?report.released, failures = report.failures.len(), "Background teardown finished");
                });
            }
            Err(_) => warn!(
                pending = registry.pending_count(),
                "Build abandoned outside a runtime; resources were not released"
            ),
        }
    }
}
