//! BDD step definitions for network candidate retry.

use cloudstack_vm::cloudstack::{ApiAction, ProviderError};
use cloudstack_vm::test_support::{deploy_response_xml, vm_list_xml};
use cloudstack_vm::{CloudStackError, ComputeBackend};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{LaunchContext, LaunchTestError};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] LaunchTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("free networks \"{networks}\"")]
fn free_networks(launch_context: LaunchContext, networks: String) -> LaunchContext {
    let ids: Vec<&str> = networks.split(',').map(str::trim).collect();
    launch_context.with_free_networks(&ids)
}

#[given("no free networks")]
fn no_free_networks(launch_context: LaunchContext) -> LaunchContext {
    launch_context.with_free_networks(&[])
}

#[given("network \"{network}\" has no free addresses")]
fn network_exhausted(launch_context: LaunchContext, network: String) -> LaunchContext {
    launch_context.harness.transport.push_error(
        ApiAction::DeployVirtualMachine,
        ProviderError::classify(
            431,
            format!("Insufficient address capacity in network {network}"),
        ),
    );
    launch_context
}

#[given("the deploy is refused with status \"{status}\"")]
fn deploy_refused(launch_context: LaunchContext, status: u16) -> LaunchContext {
    launch_context.harness.transport.push_error(
        ApiAction::DeployVirtualMachine,
        ProviderError::classify(status, "Unable to find template"),
    );
    launch_context
}

#[given("the deploy is accepted as instance \"{instance_id}\"")]
fn deploy_accepted(
    launch_context: LaunchContext,
    instance_id: String,
) -> Result<LaunchContext, StepError> {
    let transport = &launch_context.harness.transport;
    transport
        .push_xml(
            ApiAction::DeployVirtualMachine,
            &deploy_response_xml(&instance_id),
        )
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    transport
        .push_xml(
            ApiAction::ListVirtualMachines,
            &vm_list_xml(&[(instance_id.as_str(), "Running")]),
        )
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    Ok(launch_context)
}

#[when("I launch an instance")]
fn launch_instance(launch_context: LaunchContext) -> Result<LaunchContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let LaunchContext {
        harness, request, ..
    } = launch_context;

    let compute = harness.compute();
    let request_clone = request.clone();
    let outcome = runtime.block_on(async move { compute.launch(&request_clone).await });

    Ok(LaunchContext {
        harness,
        request,
        outcome: Some(outcome),
    })
}

#[then("the launch succeeds with instance \"{instance_id}\"")]
fn launch_succeeds(launch_context: &LaunchContext, instance_id: String) -> Result<(), StepError> {
    match &launch_context.outcome {
        Some(Ok(record)) if record.id == instance_id => Ok(()),
        Some(Ok(record)) => Err(StepError::Assertion(format!(
            "expected instance {instance_id}, got {}",
            record.id
        ))),
        Some(Err(err)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {err}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the launch fails because no network was viable after \"{tried}\" attempts")]
fn launch_exhausted(launch_context: &LaunchContext, tried: usize) -> Result<(), StepError> {
    match &launch_context.outcome {
        Some(Err(CloudStackError::NoViableNetwork { tried: actual })) if *actual == tried => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected no viable network after {tried} attempts, got {other:?}"
        ))),
    }
}

#[then("the launch fails with provider status \"{status}\"")]
fn launch_provider_failure(launch_context: &LaunchContext, status: u16) -> Result<(), StepError> {
    match &launch_context.outcome {
        Some(Err(CloudStackError::Provider(err))) if err.status == status => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected provider status {status}, got {other:?}"
        ))),
    }
}

#[then("\"{count}\" deploy attempts were made")]
fn deploy_attempts(launch_context: &LaunchContext, count: usize) -> Result<(), StepError> {
    let actual = launch_context
        .harness
        .transport
        .calls_to(ApiAction::DeployVirtualMachine)
        .len();
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} deploy attempts, got {actual}"
        )))
    }
}

#[then("the last attempt used network \"{network}\"")]
fn last_network(launch_context: &LaunchContext, network: String) -> Result<(), StepError> {
    let calls = launch_context
        .harness
        .transport
        .calls_to(ApiAction::DeployVirtualMachine);
    let used = calls
        .last()
        .and_then(|call| call.param("networkIds"))
        .map(str::to_owned);
    if used.as_deref() == Some(network.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected last attempt on {network}, got {used:?}"
        )))
    }
}
