//! Waits for the installed guest's command channel.
//!
//! The watcher is a bounded polling loop, not a blocking call. Connection
//! refused, no route and timeouts all mean "not yet"; only a rejected login
//! ends the wait early. The overall budget is wall-clock time measured from
//! the start of installation.

mod probe;

pub use probe::{ChannelProbe, ProbeError, ProbeOutcome, SshProbe};

#[cfg(test)]
pub use probe::MockChannelProbe;

use crate::cancellation::CancellationToken;
use crate::config::{CommunicatorConfig, ConnectionCredentials};
use crate::driver::{DriverError, GuestDriver, GuestInstance};
use crate::errors::BuildError;
use crate::remote::ChannelTarget;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Polling parameters.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Overall budget from the start of installation.
    pub timeout: Duration,
    /// Interval between probes.
    pub poll_interval: Duration,
    /// Channel port.
    pub port: u16,
    /// Fixed guest address; otherwise asked from the driver.
    pub host: Option<String>,
    /// Consecutive failed handshakes after which a stuck session is reported.
    ///
    /// Polling continues past it; only the overall budget ends the wait.
    pub handshake_attempts: u32,
}

impl From<&CommunicatorConfig> for WatchConfig {
    fn from(c: &CommunicatorConfig) -> Self {
        Self {
            timeout: c.timeout,
            poll_interval: c.poll_interval,
            port: c.port,
            host: c.host.clone(),
            handshake_attempts: c.handshake_attempts,
        }
    }
}

/// How a phase of the wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The port opened; `reachable` tells whether a session already succeeded.
    PortOpen {
        /// Where.
        target: ChannelTarget,
        /// Whether a session was opened too.
        reachable: bool,
    },
    /// A session was opened.
    Reachable(ChannelTarget),
    /// The port stayed closed past the stall deadline.
    Stalled,
}

/// Why the wait failed.
#[derive(Debug, Clone, Error)]
pub enum WatchError {
    /// The budget ran out.
    #[error("channel not reachable after {}s: {last_reason}", .elapsed.as_secs())]
    Timeout {
        /// The configured budget.
        timeout: Duration,
        /// Time waited.
        elapsed: Duration,
        /// Last "not yet" reason.
        last_reason: String,
    },

    /// The login was rejected.
    #[error("{target}: {reason}")]
    AuthRejected {
        /// `user@host:port`.
        target: String,
        /// What the channel said.
        reason: String,
    },

    /// The probe could not run.
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// The driver failed while resolving the guest address.
    #[error("resolving guest address: {0}")]
    Driver(DriverError),

    /// Cancellation was observed.
    #[error("cancelled while waiting for the command channel")]
    Cancelled,
}

impl From<WatchError> for BuildError {
    fn from(e: WatchError) -> Self {
        match e {
            WatchError::Timeout {
                timeout,
                elapsed,
                last_reason,
            } => Self::BootTimeout {
                timeout,
                elapsed,
                last_reason,
            },
            WatchError::AuthRejected { target, reason } => Self::Authentication { target, reason },
            WatchError::Probe(p) => Self::Provisioning(p.to_string()),
            WatchError::Driver(d) => Self::Provisioning(format!("resolving guest address: {d}")),
            WatchError::Cancelled => Self::Cancelled("while waiting for the command channel".into()),
        }
    }
}

/// Polls one guest's command channel.
pub struct InstallWatcher {
    probe: Arc<dyn ChannelProbe>,
    driver: Arc<dyn GuestDriver>,
    config: WatchConfig,
    started: Instant,
    deadline: Instant,
    last_reason: String,
    last_host: Option<String>,
}

impl std::fmt::Debug for InstallWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallWatcher")
            .field("config", &self.config)
            .field("last_reason", &self.last_reason)
            .field("last_host", &self.last_host)
            .finish_non_exhaustive()
    }
}

impl InstallWatcher {
    /// Starts the budget now; call on entering `Installing`.
    #[must_use]
    pub fn new(probe: Arc<dyn ChannelProbe>, driver: Arc<dyn GuestDriver>, config: WatchConfig) -> Self {
        let started = Instant::now();
        Self {
            probe,
            driver,
            deadline: started + config.timeout,
            config,
            started,
            last_reason: "no probe yet".to_string(),
            last_host: None,
        }
    }

    /// Time since the budget started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left in the budget.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Waits until the channel port opens.
    ///
    /// With `stall_at`, returns [`WatchOutcome::Stalled`] if the port is
    /// still closed at that instant. The overall deadline is never extended.
    pub async fn wait_for_port(
        &mut self,
        guest: &GuestInstance,
        credentials: &ConnectionCredentials,
        stall_at: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome, WatchError> {
        loop {
            self.check_budget(cancel)?;
            if let Some(stall) = stall_at {
                if Instant::now() >= stall {
                    debug!(guest = %guest.name, "Port still closed at stall deadline");
                    return Ok(WatchOutcome::Stalled);
                }
            }

            match self.probe_once(guest, credentials).await? {
                Some((target, ProbeOutcome::Reachable)) => {
                    info!(guest = %guest.name, target = %target, "Command channel reachable");
                    return Ok(WatchOutcome::PortOpen {
                        target,
                        reachable: true,
                    });
                }
                Some((target, ProbeOutcome::Listening(reason))) => {
                    info!(guest = %guest.name, target = %target, "Command channel port open");
                    self.last_reason = reason;
                    return Ok(WatchOutcome::PortOpen {
                        target,
                        reachable: false,
                    });
                }
                Some((target, ProbeOutcome::AuthRejected(reason))) => {
                    return Err(WatchError::AuthRejected {
                        target: credentials.target(&target.host, target.port),
                        reason,
                    })
                }
                Some((_, ProbeOutcome::Unreachable(reason))) => self.last_reason = reason,
                None => {}
            }

            let mut nap = self.config.poll_interval.min(self.remaining());
            if let Some(stall) = stall_at {
                nap = nap.min(stall.saturating_duration_since(Instant::now()));
            }
            self.nap(nap, cancel).await?;
        }
    }

    /// Waits until a session opens on a port already seen open.
    ///
    /// Failed handshakes are "not yet" like a closed port; a guest whose
    /// port stays open without ever giving a session runs into the budget.
    pub async fn wait_for_session(
        &mut self,
        guest: &GuestInstance,
        credentials: &ConnectionCredentials,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome, WatchError> {
        let mut failed_handshakes = 0u32;
        loop {
            self.check_budget(cancel)?;

            match self.probe_once(guest, credentials).await? {
                Some((target, ProbeOutcome::Reachable)) => {
                    info!(guest = %guest.name, target = %target, "Command channel reachable");
                    return Ok(WatchOutcome::Reachable(target));
                }
                Some((target, ProbeOutcome::AuthRejected(reason))) => {
                    return Err(WatchError::AuthRejected {
                        target: credentials.target(&target.host, target.port),
                        reason,
                    })
                }
                Some((target, ProbeOutcome::Listening(reason))) => {
                    failed_handshakes += 1;
                    debug!(
                        guest = %guest.name,
                        attempt = failed_handshakes,
                        reason = %reason,
                        "Session handshake failed"
                    );
                    if failed_handshakes == self.config.handshake_attempts.max(1) {
                        warn!(
                            guest = %guest.name,
                            target = %target,
                            attempts = failed_handshakes,
                            reason = %reason,
                            "Port open but no session yet; still waiting"
                        );
                    }
                    self.last_reason = format!("port open, no session: {reason}");
                }
                Some((_, ProbeOutcome::Unreachable(reason))) => {
                    failed_handshakes = 0;
                    self.last_reason = reason;
                }
                None => {}
            }

            let nap = self.config.poll_interval.min(self.remaining());
            self.nap(nap, cancel).await?;
        }
    }

    fn check_budget(&self, cancel: &CancellationToken) -> Result<(), WatchError> {
        if cancel.is_cancelled() {
            return Err(WatchError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(WatchError::Timeout {
                timeout: self.config.timeout,
                elapsed: self.elapsed(),
                last_reason: self.last_reason.clone(),
            });
        }
        Ok(())
    }

    async fn nap(&self, nap: Duration, cancel: &CancellationToken) -> Result<(), WatchError> {
        if cancel.sleep(nap).await {
            Ok(())
        } else {
            Err(WatchError::Cancelled)
        }
    }

    /// Resolves the address and probes once, bounded by the remaining budget.
    ///
    /// `None` means there was nothing to probe yet.
    async fn probe_once(
        &mut self,
        guest: &GuestInstance,
        credentials: &ConnectionCredentials,
    ) -> Result<Option<(ChannelTarget, ProbeOutcome)>, WatchError> {
        let Some(host) = self.resolve_host(guest).await? else {
            self.last_reason = "guest has no address yet".to_string();
            return Ok(None);
        };
        let target = ChannelTarget::new(host, self.config.port);

        match tokio::time::timeout(self.remaining(), self.probe.probe(&target, credentials)).await {
            Ok(outcome) => {
                let outcome = outcome?;
                debug!(target = %target, outcome = ?outcome, "Probed command channel");
                Ok(Some((target, outcome)))
            }
            Err(_) => Ok(Some((
                target,
                ProbeOutcome::Unreachable("probe cut short by ssh_timeout".into()),
            ))),
        }
    }

    async fn resolve_host(&mut self, guest: &GuestInstance) -> Result<Option<String>, WatchError> {
        if let Some(ref host) = self.config.host {
            return Ok(Some(host.clone()));
        }
        match self.driver.guest_address(guest).await {
            Ok(Some(address)) => {
                if self.last_host.as_deref() != Some(address.as_str()) {
                    info!(guest = %guest.name, address = %address, "Guest address reported");
                }
                self.last_host = Some(address.clone());
                Ok(Some(address))
            }
            Ok(None) => Ok(self.last_host.clone()),
            Err(DriverError::Cancelled) => Err(WatchError::Cancelled),
            Err(e) if e.is_transient() => {
                debug!(guest = %guest.name, error = %e, "Address lookup failed; retrying next round");
                Ok(self.last_host.clone())
            }
            Err(e) => Err(WatchError::Driver(e)),
        }
    }
}
