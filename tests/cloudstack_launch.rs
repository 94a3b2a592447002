//! Integration tests for provisioning and post-create materialization.

#[path = "common/test_constants.rs"]
mod test_constants;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cloudstack_vm::cloudstack::{
    ApiAction, Cancellation, CloudStackCompute, CloudStackError, OverrideSource, OverrideStore,
    OverrideTables, ProviderError,
};
use cloudstack_vm::config::{ApiVersion, MaterializeSettings};
use cloudstack_vm::test_support::{
    Harness, RecordingJobWaiter, StaticCapabilities, StaticNetworks, TEST_ENDPOINT, TEST_REGION,
    deploy_response_xml, vm_list_xml,
};
use cloudstack_vm::{ComputeBackend, LaunchRequest, LaunchRequestBuilder, Tag};
use rstest::{fixture, rstest};
use test_constants::{TEST_IMAGE_ID, TEST_PRODUCT_ID};

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

fn request() -> LaunchRequestBuilder {
    LaunchRequest::builder()
        .image_id(TEST_IMAGE_ID)
        .product_id(TEST_PRODUCT_ID)
        .name("web-1")
        .description("front end")
}

fn build(builder: LaunchRequestBuilder) -> LaunchRequest {
    builder
        .build()
        .unwrap_or_else(|err| panic!("launch request should be valid: {err}"))
}

fn push_xml(harness: &Harness, action: ApiAction, xml: &str) {
    harness
        .transport
        .push_xml(action, xml)
        .unwrap_or_else(|err| panic!("fixture XML should parse: {err}"));
}

fn accept_deploy(harness: &Harness, instance_id: &str) {
    push_xml(harness, ApiAction::DeployVirtualMachine, &deploy_response_xml(instance_id));
}

fn list_nothing(harness: &Harness) {
    push_xml(harness, ApiAction::ListVirtualMachines, &vm_list_xml(&[]));
}

fn list_running(harness: &Harness, instance_id: &str) {
    push_xml(
        harness,
        ApiAction::ListVirtualMachines,
        &vm_list_xml(&[(instance_id, "Running")]),
    );
}

fn deploy_calls(harness: &Harness) -> Vec<cloudstack_vm::test_support::Invocation> {
    harness.transport.calls_to(ApiAction::DeployVirtualMachine)
}

#[rstest]
#[tokio::test]
async fn instance_visible_on_second_lookup_skips_job_wait(harness: Harness) {
    accept_deploy(&harness, "42");
    list_nothing(&harness);
    list_running(&harness, "42");

    let record = harness
        .compute()
        .launch(&build(request()))
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"));

    assert_eq!(record.id, "42");
    assert_eq!(record.name, "vm-42");
    assert!(harness.jobs.labels().is_empty());
    assert_eq!(harness.transport.calls_to(ApiAction::ListVirtualMachines).len(), 2);
    assert_eq!(harness.clock.sleeps(), [Duration::from_millis(200)]);
}

#[rstest]
#[tokio::test]
async fn sibling_in_unknown_state_does_not_block_launch(harness: Harness) {
    accept_deploy(&harness, "42");
    push_xml(
        &harness,
        ApiAction::ListVirtualMachines,
        &vm_list_xml(&[("42", "Running"), ("99", "Shelved")]),
    );

    let record = harness
        .compute()
        .launch(&build(request()))
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"));

    assert_eq!(record.id, "42");
    assert!(harness.jobs.labels().is_empty());
    assert!(harness.clock.sleeps().is_empty());
}

#[rstest]
#[tokio::test]
async fn lookup_errors_back_off_and_retry(harness: Harness) {
    accept_deploy(&harness, "42");
    harness.transport.push_error(
        ApiAction::ListVirtualMachines,
        ProviderError::classify(502, "bad gateway"),
    );
    list_running(&harness, "42");

    harness
        .compute()
        .launch(&build(request()))
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"));

    assert_eq!(harness.clock.sleeps(), [Duration::from_millis(500)]);
    assert!(harness.jobs.labels().is_empty());
}

#[rstest]
#[tokio::test]
async fn deadline_falls_back_to_job_then_final_lookup(harness: Harness) {
    accept_deploy(&harness, "42");
    for _ in 0..5 {
        list_nothing(&harness);
    }
    list_running(&harness, "42");

    let record = harness
        .compute()
        .launch(&build(request()))
        .await
        .unwrap_or_else(|err| panic!("launch should succeed after the job: {err}"));

    assert_eq!(record.id, "42");
    assert_eq!(harness.jobs.labels(), ["Launch Server"]);
    assert_eq!(harness.transport.calls_to(ApiAction::ListVirtualMachines).len(), 6);
}

#[rstest]
#[tokio::test]
async fn instance_missing_after_job_is_an_error(harness: Harness) {
    accept_deploy(&harness, "42");
    list_nothing(&harness);
    let compute = harness.compute().with_settings(MaterializeSettings {
        timeout: Duration::ZERO,
        ..MaterializeSettings::default()
    });

    let err = compute
        .launch(&build(request()))
        .await
        .expect_err("invisible instance should fail");

    assert_eq!(
        err,
        CloudStackError::InstanceNotFound {
            instance_id: String::from("42"),
        }
    );
    assert_eq!(harness.jobs.labels(), ["Launch Server"]);
    assert_eq!(harness.transport.calls_to(ApiAction::ListVirtualMachines).len(), 1);
}

#[rstest]
#[tokio::test]
async fn job_failure_propagates(mut harness: Harness) {
    harness.jobs = RecordingJobWaiter::failing(CloudStackError::Provider(ProviderError::classify(
        530,
        "job failed",
    )));
    accept_deploy(&harness, "42");
    let compute = harness.compute().with_settings(MaterializeSettings {
        timeout: Duration::ZERO,
        ..MaterializeSettings::default()
    });

    let err = compute
        .launch(&build(request()))
        .await
        .expect_err("job failure should surface");
    assert!(matches!(err, CloudStackError::Provider(ref inner) if inner.status == 530));
}

#[rstest]
#[tokio::test]
async fn cancellation_stops_the_poll(harness: Harness) {
    accept_deploy(&harness, "42");
    list_nothing(&harness);
    let (handle, token) = Cancellation::pair();
    handle.cancel();

    let err = harness
        .compute()
        .with_cancellation(token)
        .launch(&build(request()))
        .await
        .expect_err("cancelled launch should stop");

    assert!(matches!(err, CloudStackError::Cancelled { .. }), "unexpected error: {err}");
    assert!(harness.jobs.labels().is_empty());
}

#[rstest]
#[tokio::test]
async fn deploy_without_instance_id_is_rejected(harness: Harness) {
    push_xml(
        &harness,
        ApiAction::DeployVirtualMachine,
        "<deployvirtualmachineresponse><jobid>1</jobid></deployvirtualmachineresponse>",
    );
    let err = harness
        .compute()
        .launch(&build(request()))
        .await
        .expect_err("missing id should fail");
    assert_eq!(err, CloudStackError::LaunchRejected);
}

#[rstest]
#[tokio::test]
async fn deploy_request_carries_core_fields(harness: Harness) {
    accept_deploy(&harness, "42");
    list_running(&harness, "42");

    harness
        .compute()
        .launch(&build(
            request()
                .key_pair(Some(String::from("deploy-key")))
                .tags(vec![Tag::new("env", "prod")]),
        ))
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"));

    let calls = deploy_calls(&harness);
    let call = calls.first().unwrap_or_else(|| panic!("deploy call expected"));
    assert_eq!(call.param("zoneId"), Some(TEST_REGION));
    assert_eq!(call.param("serviceOfferingId"), Some(TEST_PRODUCT_ID));
    assert_eq!(call.param("templateId"), Some(TEST_IMAGE_ID));
    assert_eq!(call.param("displayName"), Some("web-1"));
    assert_eq!(call.param("keypair"), Some("deploy-key"));
    assert_eq!(call.param("networkIds"), None);
    let user_data = call
        .param("userdata")
        .map(|encoded| STANDARD.decode(encoded))
        .unwrap_or_else(|| panic!("user-data expected"))
        .unwrap_or_else(|err| panic!("user-data should be base64: {err}"));
    assert_eq!(user_data, b"env=prod\n");
}

#[rstest]
#[case(Some("dc-1"), "zone-1")]
#[case(Some("elsewhere"), "elsewhere")]
#[case(None, "zone-1")]
#[tokio::test]
async fn zone_resolves_to_owning_region(
    harness: Harness,
    #[case] zone: Option<&str>,
    #[case] expected: &str,
) {
    accept_deploy(&harness, "42");
    list_running(&harness, "42");

    harness
        .compute()
        .launch(&build(request().zone(zone.map(str::to_owned))))
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"));

    let calls = deploy_calls(&harness);
    assert_eq!(calls.first().and_then(|call| call.param("zoneId")), Some(expected));
}

#[rstest]
#[tokio::test]
async fn empty_directory_fails_without_zone(mut harness: Harness) {
    harness.directory = cloudstack_vm::test_support::StaticDirectory::new();
    let err = harness
        .compute()
        .launch(&build(request()))
        .await
        .expect_err("no region to launch into");
    assert_eq!(err, CloudStackError::NoRegionAvailable);
}

#[rstest]
#[tokio::test]
async fn network_override_replaces_hint(mut harness: Harness) {
    harness.networks = Some(StaticNetworks::subscribed(&["free-1", "free-2"]));
    harness.capabilities = StaticCapabilities::new(true, true);
    accept_deploy(&harness, "42");
    list_running(&harness, "42");
    let overrides = OverrideTables::empty()
        .with_cloud_id(TEST_ENDPOINT, "east")
        .with_network("east", TEST_PRODUCT_ID, "net-forced");

    harness
        .compute()
        .with_overrides(Arc::new(OverrideStore::new(OverrideSource::Fixed(overrides))))
        .launch(&build(request().network_hint(Some(String::from("net-hint")))))
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"));

    let networks: Vec<_> = deploy_calls(&harness)
        .iter()
        .filter_map(|call| call.param("networkIds").map(str::to_owned))
        .collect();
    assert_eq!(networks, ["net-forced"]);
}

#[rstest]
#[tokio::test]
async fn hint_is_the_sole_candidate(mut harness: Harness) {
    harness.networks = Some(StaticNetworks::subscribed(&["free-1"]));
    harness.capabilities = StaticCapabilities::new(true, true);
    harness.transport.push_error(
        ApiAction::DeployVirtualMachine,
        ProviderError::classify(530, "Insufficient address capacity"),
    );

    let err = harness
        .compute()
        .launch(&build(request().network_hint(Some(String::from("net-hint")))))
        .await
        .expect_err("single exhausted candidate");

    assert_eq!(err, CloudStackError::NoViableNetwork { tried: 1 });
    assert_eq!(deploy_calls(&harness).len(), 1);
}

#[rstest]
#[tokio::test]
async fn free_networks_need_a_network_zone(mut harness: Harness) {
    harness.networks = Some(StaticNetworks::subscribed(&["free-1"]));
    harness.capabilities = StaticCapabilities::new(false, true);
    accept_deploy(&harness, "42");
    list_running(&harness, "42");

    harness
        .compute()
        .launch(&build(request()))
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"));

    let calls = deploy_calls(&harness);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls.first().and_then(|call| call.param("networkIds")), None);
}

#[rstest]
#[case(true, Some("sg-1,sg-2"))]
#[case(false, None)]
#[tokio::test]
async fn security_groups_follow_zone_support(
    mut harness: Harness,
    #[case] supported: bool,
    #[case] expected: Option<&str>,
) {
    harness.capabilities = StaticCapabilities::new(false, supported);
    accept_deploy(&harness, "42");
    list_running(&harness, "42");

    harness
        .compute()
        .launch(&build(request().firewall_ids(["sg-1", " ", "sg-2 "])))
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"));

    let calls = deploy_calls(&harness);
    assert_eq!(calls.first().and_then(|call| call.param("securitygroupids")), expected);
    assert_eq!(
        harness.capabilities.security_group_queries(),
        [(String::from(TEST_REGION), true)]
    );
}

#[rstest]
#[tokio::test]
async fn non_capacity_failure_aborts_immediately(mut harness: Harness) {
    harness.networks = Some(StaticNetworks::subscribed(&["a", "b", "c"]));
    harness.capabilities = StaticCapabilities::new(true, true);
    harness.transport.push_error(
        ApiAction::DeployVirtualMachine,
        ProviderError::classify(431, "Unable to find template"),
    );

    let err = harness
        .compute()
        .launch(&build(request()))
        .await
        .expect_err("unrecoverable failure");

    assert!(matches!(err, CloudStackError::Provider(ref inner) if inner.status == 431));
    assert_eq!(deploy_calls(&harness).len(), 1);
}

#[rstest]
#[tokio::test]
async fn legacy_api_sends_minimal_request(harness: Harness) {
    accept_deploy(&harness, "42");
    list_running(&harness, "42");
    let context = Harness::context().with_api_version(ApiVersion::V2_1);
    let compute = CloudStackCompute::new(context, harness.collaborators())
        .with_clock(Arc::new(harness.clock.clone()));

    compute
        .launch(&build(
            request()
                .key_pair(Some(String::from("deploy-key")))
                .firewall_ids(["sg-1"])
                .network_hint(Some(String::from("net-hint"))),
        ))
        .await
        .unwrap_or_else(|err| panic!("legacy launch should succeed: {err}"));

    let calls = deploy_calls(&harness);
    let names: Vec<_> = calls
        .first()
        .map(|call| call.params.iter().map(|param| param.name.as_str()).collect())
        .unwrap_or_default();
    assert_eq!(names, ["zoneId", "serviceOfferingId", "templateId", "displayName"]);
}

#[rstest]
#[tokio::test]
async fn launch_requires_a_region(harness: Harness) {
    let compute = CloudStackCompute::new(
        cloudstack_vm::config::ProviderContext::new(TEST_ENDPOINT, None),
        harness.collaborators(),
    );
    let err = compute
        .launch(&build(request()))
        .await
        .expect_err("region is required");
    assert!(matches!(err, CloudStackError::Config(_)), "unexpected error: {err}");
    assert!(harness.transport.invocations().is_empty());
}
