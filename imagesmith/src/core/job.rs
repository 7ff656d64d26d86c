//! The record of one build run.

use super::{Artifact, BuildState, StateRecord};
use crate::config::BuildConfig;
use crate::errors::BuildError;
use crate::observability::StateTimer;
use std::sync::Arc;
use uuid::Uuid;

/// One build run.
///
/// Owned by the coordinator for the whole run. Holds the resolved
/// configuration, the current state with its history, and the result slot.
#[derive(Debug)]
pub struct BuildJob {
    config: Arc<BuildConfig>,
    state: BuildState,
    history: Vec<StateRecord>,
    timer: StateTimer,
    result: Option<Result<Artifact, BuildError>>,
}

impl BuildJob {
    /// Creates a job in `Init`.
    #[must_use]
    pub fn new(config: BuildConfig) -> Self {
        Self::from_shared(Arc::new(config))
    }

    /// Creates a job from an already shared configuration.
    #[must_use]
    pub fn from_shared(config: Arc<BuildConfig>) -> Self {
        Self {
            config,
            state: BuildState::Init,
            history: vec![StateRecord {
                state: BuildState::Init,
                entered_at: crate::utils::iso_timestamp(),
                duration_ms: None,
            }],
            timer: StateTimer::start(BuildState::Init),
            result: None,
        }
    }

    /// The build identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.config.build_id
    }

    /// The guest name, used to tag progress output.
    #[must_use]
    pub fn guest_name(&self) -> &str {
        &self.config.template.source.guest_name
    }

    /// The resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<BuildConfig> {
        &self.config
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> BuildState {
        self.state
    }

    /// States visited so far.
    #[must_use]
    pub fn history(&self) -> &[StateRecord] {
        &self.history
    }

    /// Moves to `next`, closing the timing of the current state.
    ///
    /// Returns the time spent in the state that was left.
    pub fn transition(&mut self, next: BuildState) -> Result<f64, BuildError> {
        if !self.state.can_transition_to(next) {
            return Err(BuildError::Internal(format!(
                "illegal transition {} -> {}",
                self.state, next
            )));
        }

        let previous = std::mem::replace(&mut self.timer, StateTimer::start(next));
        let duration_ms = previous.finish();
        if let Some(last) = self.history.last_mut() {
            last.duration_ms = Some(duration_ms);
        }
        self.history.push(StateRecord {
            state: next,
            entered_at: crate::utils::iso_timestamp(),
            duration_ms: None,
        });
        self.state = next;
        Ok(duration_ms)
    }

    /// Fills the result slot.
    pub fn set_result(&mut self, result: Result<Artifact, BuildError>) {
        self.result = Some(result);
    }

    /// Takes the result slot.
    pub fn take_result(&mut self) -> Option<Result<Artifact, BuildError>> {
        self.result.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBuild;

    #[test]
    fn test_new_job_starts_in_init() {
        let fixture = TestBuild::new();
        let job = BuildJob::new(fixture.config());
        assert_eq!(job.state(), BuildState::Init);
        assert_eq!(job.history().len(), 1);
        assert_eq!(job.guest_name(), "rhel9-test");
    }

    #[test]
    fn test_transition_records_history() {
        let fixture = TestBuild::new();
        let mut job = BuildJob::new(fixture.config());

        job.transition(BuildState::Provisioning).unwrap();
        job.transition(BuildState::Failed).unwrap();

        let states: Vec<_> = job.history().iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![BuildState::Init, BuildState::Provisioning, BuildState::Failed]
        );
        assert!(job.history()[0].duration_ms.is_some());
        assert!(job.history()[2].duration_ms.is_none());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let fixture = TestBuild::new();
        let mut job = BuildJob::new(fixture.config());
        let err = job.transition(BuildState::Finalizing).unwrap_err();
        assert!(matches!(err, BuildError::Internal(_)));
        assert_eq!(job.state(), BuildState::Init);
    }

    #[test]
    fn test_result_slot_is_taken_once() {
        let fixture = TestBuild::new();
        let mut job = BuildJob::new(fixture.config());
        assert!(job.take_result().is_none());

        job.set_result(Err(BuildError::Cancelled("SIGINT".into())));
        let taken = job.take_result().unwrap();
        assert!(taken.unwrap_err().is_cancelled());
        assert!(job.take_result().is_none());
    }

    #[test]
    fn test_no_transition_out_of_terminal_state() {
        let fixture = TestBuild::new();
        let mut job = BuildJob::new(fixture.config());
        job.transition(BuildState::Failed).unwrap();
        assert!(job.transition(BuildState::Failed).is_err());
        assert!(job.transition(BuildState::Provisioning).is_err());
    }
}
