//! Shared fixtures for launch BDD scenarios.

use cloudstack_vm::test_support::{Harness, StaticCapabilities, StaticNetworks};
use cloudstack_vm::{CloudStackError, LaunchRequest, VirtualMachineRecord};
use rstest::fixture;
use thiserror::Error;

use crate::test_constants::{TEST_IMAGE_ID, TEST_PRODUCT_ID};

#[derive(Clone, Debug)]
pub struct LaunchContext {
    pub harness: Harness,
    pub request: LaunchRequest,
    pub outcome: Option<Result<VirtualMachineRecord, CloudStackError>>,
}

impl LaunchContext {
    pub fn with_free_networks(mut self, networks: &[&str]) -> Self {
        self.harness.networks = Some(StaticNetworks::subscribed(networks));
        self
    }
}

#[derive(Clone, Debug, Error)]
pub enum LaunchTestError {
    #[error("invalid launch fixture: {0}")]
    Fixture(String),
}

pub type LaunchContextResult = Result<LaunchContext, LaunchTestError>;

#[fixture]
pub fn launch_context_result() -> LaunchContextResult {
    build_launch_context()
}

#[fixture]
pub fn launch_context(launch_context_result: LaunchContextResult) -> LaunchContext {
    launch_context_result
        .unwrap_or_else(|err| panic!("launch context fixture should initialise: {err}"))
}

fn build_launch_context() -> LaunchContextResult {
    let request = LaunchRequest::builder()
        .image_id(TEST_IMAGE_ID)
        .product_id(TEST_PRODUCT_ID)
        .name("bdd-vm")
        .build()
        .map_err(|err| LaunchTestError::Fixture(format!("launch request: {err}")))?;

    let mut harness = Harness::new();
    harness.capabilities = StaticCapabilities::new(true, true);

    Ok(LaunchContext {
        harness,
        request,
        outcome: None,
    })
}
