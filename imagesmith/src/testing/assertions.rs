//! Test assertions for build outcomes.

use crate::coordinator::BuildReport;
use crate::core::{BuildState, StateRecord};
use crate::errors::{BuildFailure, TeardownReport};

/// Asserts that the build reached `Done` and returns its report.
pub fn assert_build_succeeded(result: &Result<BuildReport, BuildFailure>) -> &BuildReport {
    match result {
        Ok(report) => {
            assert_eq!(
                report.history.last().map(|r| r.state),
                Some(BuildState::Done),
                "Expected the build to end in Done"
            );
            report
        }
        Err(failure) => panic!(
            "Expected success, build failed in {} with {}: {}",
            failure.state,
            failure.error.kind(),
            failure.error
        ),
    }
}

/// Asserts that the build failed with an error of `kind` and returns the failure.
pub fn assert_build_failed_with<'a>(
    result: &'a Result<BuildReport, BuildFailure>,
    kind: &str,
) -> &'a BuildFailure {
    match result {
        Ok(report) => panic!(
            "Expected {kind}, build succeeded with artifact {}",
            report.artifact.id
        ),
        Err(failure) => {
            assert_eq!(
                failure.error.kind(),
                kind,
                "Expected {kind}, got {}: {}",
                failure.error.kind(),
                failure.error
            );
            assert_eq!(
                failure.history.last().map(|r| r.state),
                Some(BuildState::Failed),
                "Expected the build to end in Failed"
            );
            failure
        }
    }
}

/// Asserts that teardown released exactly `expected`, in that order, without failures.
pub fn assert_teardown_released(report: &TeardownReport, expected: &[&str]) {
    assert!(
        report.is_clean(),
        "Expected a clean teardown, got failures: {:?}",
        report.failures
    );
    assert_eq!(
        report.released, expected,
        "Expected teardown to release {:?}, got {:?}",
        expected, report.released
    );
}

/// Asserts that the visited states are exactly `expected`.
pub fn assert_history(history: &[StateRecord], expected: &[BuildState]) {
    let states: Vec<BuildState> = history.iter().map(|r| r.state).collect();
    assert_eq!(states, expected, "Unexpected state history");
}
