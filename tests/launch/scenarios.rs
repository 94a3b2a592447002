//! BDD scenarios for network candidate retry.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LaunchContextResult, launch_context_result};

#[scenario(
    path = "tests/features/launch.feature",
    name = "Launch succeeds on the third network after two capacity failures"
)]
fn scenario_third_network(launch_context_result: LaunchContextResult) {
    drop(launch_context_result);
}

#[scenario(
    path = "tests/features/launch.feature",
    name = "Launch fails when every network is exhausted"
)]
fn scenario_all_exhausted(launch_context_result: LaunchContextResult) {
    drop(launch_context_result);
}

#[scenario(
    path = "tests/features/launch.feature",
    name = "Launch stops at the first unrelated failure"
)]
fn scenario_unrelated_failure(launch_context_result: LaunchContextResult) {
    drop(launch_context_result);
}

#[scenario(
    path = "tests/features/launch.feature",
    name = "Launch without free networks sends a single request"
)]
fn scenario_no_free_networks(launch_context_result: LaunchContextResult) {
    drop(launch_context_result);
}
