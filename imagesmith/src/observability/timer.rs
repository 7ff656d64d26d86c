//! Per-state timing and build spans.

use crate::core::BuildState;
use tokio::time::Instant;
use uuid::Uuid;

/// Measures the time spent in one state.
///
/// Uses the tokio clock so paused-time tests report virtual durations.
#[derive(Debug)]
pub struct StateTimer {
    start: Instant,
    state: BuildState,
}

impl StateTimer {
    /// Starts timing `state`.
    #[must_use]
    pub fn start(state: BuildState) -> Self {
        Self {
            start: Instant::now(),
            state,
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// The state being timed.
    #[must_use]
    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Stops the timer and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!(state = %self.state, duration_ms = elapsed, "State finished");
        elapsed
    }
}

/// Creates the span every log line of one build is recorded under.
#[must_use]
pub fn build_span(build_id: Uuid, guest: &str) -> tracing::Span {
    tracing::info_span!("build", build_id = %build_id, guest = %guest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_timer_uses_tokio_clock() {
        let timer = StateTimer::start(BuildState::Installing);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(timer.state(), BuildState::Installing);
        let ms = timer.finish();
        assert!((90_000.0..91_000.0).contains(&ms), "{ms}");
    }
}
