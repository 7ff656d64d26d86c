//! Sends a resolved boot command to a guest console.

use super::sequence::ResolvedBootSequence;
use crate::cancellation::CancellationToken;
use crate::driver::{DriverError, GuestDriver, GuestInstance};
use crate::utils::duration::deserialize_duration;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Whether a boot command may be sent more than once.
///
/// The installer never acknowledges console input, so success is only ever
/// detected by the install watcher. `Single` treats the one injection as
/// authoritative. `Reinject` re-sends the sequence when the guest's channel
/// port has not started listening `stall_after` after the last injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BootInjectionPolicy {
    /// Inject once.
    #[default]
    Single,
    /// Re-send after a stall, a bounded number of times.
    Reinject {
        /// Extra injections allowed after the first.
        #[serde(default = "default_max_reinjections")]
        max_reinjections: u32,
        /// Time without a listening port before re-sending.
        #[serde(deserialize_with = "deserialize_duration")]
        stall_after: Duration,
    },
}

const fn default_max_reinjections() -> u32 {
    1
}

impl BootInjectionPolicy {
    /// How long to wait for the port before a re-send, if re-sends are allowed.
    #[must_use]
    pub fn stall_after(&self) -> Option<Duration> {
        match self {
            Self::Single => None,
            Self::Reinject { stall_after, .. } => Some(*stall_after),
        }
    }

    /// Extra injections allowed after the first.
    #[must_use]
    pub fn max_reinjections(&self) -> u32 {
        match self {
            Self::Single => 0,
            Self::Reinject {
                max_reinjections, ..
            } => *max_reinjections,
        }
    }
}

/// Errors produced while injecting.
#[derive(Debug, Clone, Error)]
pub enum InjectError {
    /// The sequence was already sent and the policy forbids another send.
    #[error("boot command already injected {0} time(s); policy allows no more")]
    Exhausted(u32),

    /// The driver rejected a keystroke batch.
    #[error("sending keys failed: {0}")]
    Driver(#[from] DriverError),

    /// Cancellation arrived during a pause.
    #[error("cancelled during boot injection")]
    Cancelled,
}

/// Types a boot command at a guest console.
///
/// Holds the count of injections for one build, so the at-most-once rule
/// (or the policy's bound) is enforced here rather than by callers.
pub struct BootInjector {
    driver: Arc<dyn GuestDriver>,
    policy: BootInjectionPolicy,
    injections: AtomicU32,
}

impl std::fmt::Debug for BootInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootInjector")
            .field("driver", &self.driver.name())
            .field("policy", &self.policy)
            .field("injections", &self.injections())
            .finish()
    }
}

impl BootInjector {
    /// Creates an injector for one build.
    #[must_use]
    pub fn new(driver: Arc<dyn GuestDriver>, policy: BootInjectionPolicy) -> Self {
        Self {
            driver,
            policy,
            injections: AtomicU32::new(0),
        }
    }

    /// Number of times the sequence was sent.
    #[must_use]
    pub fn injections(&self) -> u32 {
        self.injections.load(Ordering::SeqCst)
    }

    /// The configured policy.
    #[must_use]
    pub fn policy(&self) -> BootInjectionPolicy {
        self.policy
    }

    /// Returns true if another send is allowed.
    #[must_use]
    pub fn can_reinject(&self) -> bool {
        let sent = self.injections();
        sent > 0 && sent <= self.policy.max_reinjections()
    }

    /// Sends the sequence for the first time.
    pub async fn inject(
        &self,
        guest: &GuestInstance,
        sequence: &ResolvedBootSequence,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        self.injections
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(InjectError::Exhausted)?;
        info!(guest = %guest.name, steps = sequence.steps().len(), "Typing boot command");
        self.send(guest, sequence, cancel).await
    }

    /// Sends the sequence again, if the policy allows.
    pub async fn reinject(
        &self,
        guest: &GuestInstance,
        sequence: &ResolvedBootSequence,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let max_total = 1 + self.policy.max_reinjections();
        self.injections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0 && n < max_total).then_some(n + 1)
            })
            .map_err(InjectError::Exhausted)?;
        info!(
            guest = %guest.name,
            injection = self.injections(),
            "Re-typing boot command after stall"
        );
        self.send(guest, sequence, cancel).await
    }

    async fn send(
        &self,
        guest: &GuestInstance,
        sequence: &ResolvedBootSequence,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        for (index, step) in sequence.steps().iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(InjectError::Cancelled);
            }
            if !step.keys.is_empty() {
                debug!(step = index, keys = step.keys.len(), "Sending keys");
                self.driver.send_keys(guest, &step.keys).await?;
            }
            if !step.wait_after.is_zero() && !cancel.sleep(step.wait_after).await {
                return Err(InjectError::Cancelled);
            }
        }
        Ok(())
    }
}
