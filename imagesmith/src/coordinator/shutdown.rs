//! Bringing the provisioned guest to a powered-off state.

use crate::cancellation::CancellationToken;
use crate::config::{ConnectionCredentials, ShutdownConfig};
use crate::driver::{DriverError, GuestDriver, GuestInstance, PowerState};
use crate::errors::BuildError;
use crate::remote::{ChannelTarget, RemoteShell};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a forced power-off may take to show.
pub const FORCED_OFF_CONFIRM: Duration = Duration::from_secs(60);

/// How the guest ended up powered off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// The guest halted after the shutdown command.
    Graceful,
    /// The driver had to force it off.
    Forced,
}

/// Halts the guest, preferring the in-guest shutdown command.
pub(crate) struct Shutdown<'a> {
    pub driver: &'a dyn GuestDriver,
    pub shell: &'a dyn RemoteShell,
    pub config: &'a ShutdownConfig,
    pub cancel: &'a CancellationToken,
}

impl Shutdown<'_> {
    pub(crate) async fn run(
        &self,
        guest: &GuestInstance,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
    ) -> Result<ShutdownKind, BuildError> {
        if let Some(ref command) = self.config.command {
            info!(guest = %guest.name, "Running shutdown command");
            // One grace period covers the command and the wait for power-off.
            let grace_ends = Instant::now() + self.config.timeout;
            match self
                .shell
                .execute(target, credentials, command, self.config.timeout)
                .await
            {
                Ok(output) => debug!(exit_code = ?output.exit_code, "Shutdown command returned"),
                Err(e) => debug!(error = %e, "Channel dropped during shutdown"),
            }
            if self.wait_for_off(guest, grace_ends).await? {
                return Ok(ShutdownKind::Graceful);
            }
            warn!(
                guest = %guest.name,
                timeout_secs = self.config.timeout.as_secs(),
                "Guest still running after shutdown grace period; forcing power-off"
            );
        } else {
            warn!(guest = %guest.name, "No shutdown command configured; forcing power-off");
        }

        self.driver
            .power_off(guest)
            .await
            .map_err(|e| self.driver_error("forced power-off failed", e))?;
        if self.wait_for_off(guest, Instant::now() + FORCED_OFF_CONFIRM).await? {
            Ok(ShutdownKind::Forced)
        } else {
            Err(BuildError::Shutdown(format!(
                "guest {} still running {}s after forced power-off",
                guest.id,
                FORCED_OFF_CONFIRM.as_secs()
            )))
        }
    }

    /// Polls the power state until `Off` or `deadline` passes.
    async fn wait_for_off(&self, guest: &GuestInstance, deadline: Instant) -> Result<bool, BuildError> {
        loop {
            match self.driver.power_state(guest).await {
                Ok(PowerState::Off) => return Ok(true),
                Ok(state) => debug!(guest = %guest.name, ?state, "Waiting for power-off"),
                Err(e @ DriverError::Cancelled) => {
                    return Err(self.driver_error("power state", e));
                }
                Err(e) => debug!(guest = %guest.name, error = %e, "Power state unavailable"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if !self.cancel.sleep(self.config.poll_interval.min(remaining)).await {
                return Err(BuildError::Cancelled(self.cancel_reason()));
            }
        }
    }

    fn driver_error(&self, what: &str, e: DriverError) -> BuildError {
        if matches!(e, DriverError::Cancelled) {
            BuildError::Cancelled(self.cancel_reason())
        } else {
            BuildError::Shutdown(format!("{what}: {e}"))
        }
    }

    fn cancel_reason(&self) -> String {
        self.cancel
            .reason()
            .unwrap_or_else(|| "cancelled during shutdown".to_string())
    }
}
