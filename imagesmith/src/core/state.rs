//! Build states and the transitions between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of one build.
///
/// The happy path is linear. `Failed` is reachable from every non-terminal
/// state. Teardown is not a state: it runs on every exit path before the
/// job reports `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// Validating inputs; nothing exists yet.
    Init,
    /// Starting the artifact server and creating the guest.
    Provisioning,
    /// Waiting out `boot_wait` and typing the boot command.
    BootInjecting,
    /// The installer runs; the command channel port is not open yet.
    Installing,
    /// The port answers; waiting for an authenticated session.
    AwaitingChannel,
    /// Running the external provisioner against the guest.
    RemoteProvisioning,
    /// Bringing the guest to a powered-off state.
    ShuttingDown,
    /// Converting the guest and recording the artifact.
    Finalizing,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Failed,
}

impl BuildState {
    /// The linear happy path, in order.
    pub const HAPPY_PATH: [Self; 9] = [
        Self::Init,
        Self::Provisioning,
        Self::BootInjecting,
        Self::Installing,
        Self::AwaitingChannel,
        Self::RemoteProvisioning,
        Self::ShuttingDown,
        Self::Finalizing,
        Self::Done,
    ];

    /// Returns true if the state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns true if a guest may exist while the job is in this state.
    #[must_use]
    pub fn may_hold_guest(&self) -> bool {
        !matches!(self, Self::Init | Self::Done | Self::Failed)
    }

    /// The next state on the happy path.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        let idx = Self::HAPPY_PATH.iter().position(|s| s == self)?;
        Self::HAPPY_PATH.get(idx + 1).copied()
    }

    /// Returns true if moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || self.next() == Some(next)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "Init",
            Self::Provisioning => "Provisioning",
            Self::BootInjecting => "BootInjecting",
            Self::Installing => "Installing",
            Self::AwaitingChannel => "AwaitingChannel",
            Self::RemoteProvisioning => "RemoteProvisioning",
            Self::ShuttingDown => "ShuttingDown",
            Self::Finalizing => "Finalizing",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// One visited state with its timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// The state.
    pub state: BuildState,
    /// When the state was entered (RFC 3339).
    pub entered_at: String,
    /// Time spent in the state, once left.
    pub duration_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        for pair in BuildState::HAPPY_PATH.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal() {
        for state in BuildState::HAPPY_PATH {
            assert_eq!(state.can_transition_to(BuildState::Failed), !state.is_terminal());
        }
    }

    #[test]
    fn test_no_skipping_or_leaving_terminal() {
        assert!(!BuildState::Init.can_transition_to(BuildState::BootInjecting));
        assert!(!BuildState::RemoteProvisioning.can_transition_to(BuildState::Finalizing));
        assert!(!BuildState::Done.can_transition_to(BuildState::Failed));
        assert!(!BuildState::Failed.can_transition_to(BuildState::Init));
    }

    #[test]
    fn test_guest_window() {
        assert!(!BuildState::Init.may_hold_guest());
        assert!(BuildState::Provisioning.may_hold_guest());
        assert!(BuildState::Finalizing.may_hold_guest());
        assert!(!BuildState::Done.may_hold_guest());
    }

    #[test]
    fn test_state_serialize() {
        let json = serde_json::to_string(&BuildState::AwaitingChannel).unwrap();
        assert_eq!(json, r#""awaiting_channel""#);
        assert_eq!(BuildState::AwaitingChannel.to_string(), "AwaitingChannel");
    }
}
