//! Testing utilities for imagesmith builds.
//!
//! This module provides:
//! - An in-memory guest driver, a scripted channel probe and a recording shell
//! - A throwaway build directory with a working template
//! - Assertions on build reports, failures and teardown

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_build_failed_with, assert_build_succeeded, assert_history, assert_teardown_released,
};
pub use fixtures::{TestBuild, FIXTURE_KICKSTART};
pub use mocks::{
    guest_spec, DriverCall, MockGuestDriver, ProbeCall, RecordingShell, ScriptedProbe,
};
