//! Test support utilities shared across unit and integration tests.
//!
//! Every collaborator the compute core talks to has a scripted double here.
//! Doubles share their state behind `Arc<Mutex<_>>` so a test can keep a
//! handle, give a clone to the service, and inspect the calls afterwards.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard};

use crate::backend::BackendFuture;
use crate::cloudstack::{
    ApiAction, CloudStackCompute, CloudStackError, Clock, Collaborators, DataCenter,
    DataCenterDirectory, FirewallService, JobWaiter, NetworkService, Param, ProviderError, Region,
    ResponseDocument, SleepFuture, Transport, ZoneCapabilities,
};
use crate::config::{MaterializeSettings, ProviderContext};

/// Endpoint used by [`Harness`] services.
pub const TEST_ENDPOINT: &str = "https://cloud.example.test/client/api";
/// Region used by [`Harness`] services.
pub const TEST_REGION: &str = "zone-1";
/// Account used by [`Harness`] services.
pub const TEST_ACCOUNT: &str = "acct-1";

fn locked<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a single call made through [`ScriptedTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invocation {
    /// Command issued.
    pub action: ApiAction,
    /// Parameters sent.
    pub params: Vec<Param>,
}

impl Invocation {
    /// Value of the named parameter, if sent.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|param| param.name == name)
            .map(|param| param.value.as_str())
    }
}

type Scripted = Result<ResponseDocument, ProviderError>;

/// Transport that returns pre-seeded responses per command in FIFO order.
///
/// A command with nothing queued fails with HTTP 500.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    responses: Arc<StdMutex<HashMap<ApiAction, VecDeque<Scripted>>>>,
    invocations: Arc<StdMutex<Vec<Invocation>>>,
}

impl ScriptedTransport {
    /// Creates a transport with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a parsed response for `action`.
    pub fn push_response(&self, action: ApiAction, response: ResponseDocument) {
        locked(&self.responses)
            .entry(action)
            .or_default()
            .push_back(Ok(response));
    }

    /// Parses and queues an XML response for `action`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudStackError::MalformedResponse`] when `xml` does not
    /// parse.
    pub fn push_xml(&self, action: ApiAction, xml: &str) -> Result<(), CloudStackError> {
        self.push_response(action, ResponseDocument::parse(xml)?);
        Ok(())
    }

    /// Queues a failure for `action`.
    pub fn push_error(&self, action: ApiAction, error: ProviderError) {
        locked(&self.responses)
            .entry(action)
            .or_default()
            .push_back(Err(error));
    }

    /// Snapshot of every call made so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        locked(&self.invocations).clone()
    }

    /// Calls made for one command.
    #[must_use]
    pub fn calls_to(&self, action: ApiAction) -> Vec<Invocation> {
        locked(&self.invocations)
            .iter()
            .filter(|call| call.action == action)
            .cloned()
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn invoke<'a>(
        &'a self,
        action: ApiAction,
        params: &'a [Param],
    ) -> BackendFuture<'a, ResponseDocument, ProviderError> {
        locked(&self.invocations).push(Invocation {
            action,
            params: params.to_vec(),
        });
        let next = locked(&self.responses)
            .get_mut(&action)
            .and_then(VecDeque::pop_front);
        Box::pin(async move {
            next.unwrap_or_else(|| {
                Err(ProviderError::classify(
                    500,
                    format!("no scripted response for {action}"),
                ))
            })
        })
    }
}

/// Job waiter that records labels and returns a fixed outcome.
#[derive(Clone, Debug, Default)]
pub struct RecordingJobWaiter {
    labels: Arc<StdMutex<Vec<String>>>,
    failure: Option<CloudStackError>,
}

impl RecordingJobWaiter {
    /// Creates a waiter whose jobs always succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a waiter whose jobs always fail with `error`.
    #[must_use]
    pub fn failing(error: CloudStackError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// Labels of every job awaited so far.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        locked(&self.labels).clone()
    }
}

impl JobWaiter for RecordingJobWaiter {
    fn await_completion<'a>(
        &'a self,
        _response: &'a ResponseDocument,
        label: &'a str,
    ) -> BackendFuture<'a, (), CloudStackError> {
        locked(&self.labels).push(label.to_owned());
        let outcome = self.failure.clone().map_or(Ok(()), Err);
        Box::pin(async move { outcome })
    }
}

/// Fixed region and datacenter listing.
#[derive(Clone, Debug, Default)]
pub struct StaticDirectory {
    regions: Vec<Region>,
    datacenters: HashMap<String, Vec<DataCenter>>,
}

impl StaticDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a region owning the named datacenters.
    #[must_use]
    pub fn with_region(mut self, region_id: &str, datacenter_ids: &[&str]) -> Self {
        self.regions.push(Region {
            id: region_id.to_owned(),
            name: region_id.to_owned(),
        });
        self.datacenters.insert(
            region_id.to_owned(),
            datacenter_ids
                .iter()
                .map(|id| DataCenter {
                    id: (*id).to_owned(),
                    region_id: region_id.to_owned(),
                    name: (*id).to_owned(),
                })
                .collect(),
        );
        self
    }
}

impl DataCenterDirectory for StaticDirectory {
    fn list_regions(&self) -> BackendFuture<'_, Vec<Region>, CloudStackError> {
        Box::pin(async move { Ok(self.regions.clone()) })
    }

    fn list_datacenters<'a>(
        &'a self,
        region_id: &'a str,
    ) -> BackendFuture<'a, Vec<DataCenter>, CloudStackError> {
        Box::pin(async move { Ok(self.datacenters.get(region_id).cloned().unwrap_or_default()) })
    }
}

/// Zone capability answers fixed at construction.
#[derive(Clone, Debug)]
pub struct StaticCapabilities {
    /// Answer to "does the zone require a network".
    pub requires_network: bool,
    /// Answer to "does the zone support security groups".
    pub supports_security_groups: bool,
    queries: Arc<StdMutex<Vec<(String, bool)>>>,
}

impl StaticCapabilities {
    /// Creates fixed answers.
    #[must_use]
    pub fn new(requires_network: bool, supports_security_groups: bool) -> Self {
        Self {
            requires_network,
            supports_security_groups,
            queries: Arc::default(),
        }
    }

    /// Zone and basic-network flag of every security group query.
    #[must_use]
    pub fn security_group_queries(&self) -> Vec<(String, bool)> {
        locked(&self.queries).clone()
    }
}

impl Default for StaticCapabilities {
    fn default() -> Self {
        Self::new(false, true)
    }
}

impl ZoneCapabilities for StaticCapabilities {
    fn requires_network<'a>(
        &'a self,
        _zone_id: &'a str,
    ) -> BackendFuture<'a, bool, CloudStackError> {
        Box::pin(async move { Ok(self.requires_network) })
    }

    fn supports_security_groups<'a>(
        &'a self,
        zone_id: &'a str,
        basic_network: bool,
    ) -> BackendFuture<'a, bool, CloudStackError> {
        locked(&self.queries).push((zone_id.to_owned(), basic_network));
        Box::pin(async move { Ok(self.supports_security_groups) })
    }
}

/// VLAN service with a fixed free-network list.
#[derive(Clone, Debug, Default)]
pub struct StaticNetworks {
    /// Whether the account may use VLANs.
    pub subscribed: bool,
    /// Networks reported as free, best first.
    pub free: Vec<String>,
}

impl StaticNetworks {
    /// A subscribed service reporting `free`.
    #[must_use]
    pub fn subscribed(free: &[&str]) -> Self {
        Self {
            subscribed: true,
            free: free.iter().map(|id| (*id).to_owned()).collect(),
        }
    }
}

impl NetworkService for StaticNetworks {
    fn is_subscribed(&self) -> BackendFuture<'_, bool, CloudStackError> {
        Box::pin(async move { Ok(self.subscribed) })
    }

    fn find_free_networks(&self) -> BackendFuture<'_, Vec<String>, CloudStackError> {
        Box::pin(async move { Ok(self.free.clone()) })
    }
}

/// Security group listing keyed by instance.
#[derive(Clone, Debug, Default)]
pub struct StaticFirewalls {
    by_instance: HashMap<String, Vec<String>>,
}

impl StaticFirewalls {
    /// Attaches security groups to an instance.
    #[must_use]
    pub fn with_instance(mut self, instance_id: &str, groups: &[&str]) -> Self {
        self.by_instance.insert(
            instance_id.to_owned(),
            groups.iter().map(|group| (*group).to_owned()).collect(),
        );
        self
    }
}

impl FirewallService for StaticFirewalls {
    fn list_firewalls_for_vm<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, Vec<String>, CloudStackError> {
        Box::pin(async move { Ok(self.by_instance.get(instance_id).cloned().unwrap_or_default()) })
    }
}

/// Clock that advances only when slept on.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<StdMutex<Instant>>,
    sleeps: Arc<StdMutex<Vec<Duration>>>,
}

impl ManualClock {
    /// Creates a clock starting at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Arc::new(StdMutex::new(Instant::now())),
            sleeps: Arc::default(),
        }
    }

    /// Every sleep requested so far.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        locked(&self.sleeps).clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *locked(&self.now)
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        locked(&self.sleeps).push(duration);
        let mut now = locked(&self.now);
        *now += duration;
        Box::pin(async {})
    }
}

/// Scripted doubles wired into a [`CloudStackCompute`].
#[derive(Clone, Debug)]
pub struct Harness {
    /// API channel double.
    pub transport: ScriptedTransport,
    /// Job waiter double.
    pub jobs: RecordingJobWaiter,
    /// Region directory double.
    pub directory: StaticDirectory,
    /// Zone capability double.
    pub capabilities: StaticCapabilities,
    /// VLAN double; `None` models a deployment without VLAN support.
    pub networks: Option<StaticNetworks>,
    /// Security group double.
    pub firewalls: Option<StaticFirewalls>,
    /// Clock driving materialization.
    pub clock: ManualClock,
}

impl Harness {
    /// Creates a harness with one region, `zone-1`, owning datacenter `dc-1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transport: ScriptedTransport::new(),
            jobs: RecordingJobWaiter::new(),
            directory: StaticDirectory::new().with_region(TEST_REGION, &["dc-1"]),
            capabilities: StaticCapabilities::default(),
            networks: None,
            firewalls: None,
            clock: ManualClock::new(),
        }
    }

    /// Collaborators backed by the harness doubles.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            transport: Arc::new(self.transport.clone()),
            jobs: Arc::new(self.jobs.clone()),
            directory: Arc::new(self.directory.clone()),
            capabilities: Arc::new(self.capabilities.clone()),
            networks: self
                .networks
                .clone()
                .map(|networks| Arc::new(networks) as Arc<dyn NetworkService>),
            firewalls: self
                .firewalls
                .clone()
                .map(|firewalls| Arc::new(firewalls) as Arc<dyn FirewallService>),
        }
    }

    /// Provider context for the test endpoint, region and account.
    #[must_use]
    pub fn context() -> ProviderContext {
        ProviderContext::new(TEST_ENDPOINT, Some(String::from(TEST_REGION)))
            .with_account(TEST_ACCOUNT)
    }

    /// A compute service over the harness doubles with a one-second
    /// materialization deadline on the manual clock.
    #[must_use]
    pub fn compute(&self) -> CloudStackCompute {
        CloudStackCompute::new(Self::context(), self.collaborators())
            .with_clock(Arc::new(self.clock.clone()))
            .with_settings(MaterializeSettings {
                timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(200),
                error_backoff: Duration::from_millis(500),
            })
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// A `deployVirtualMachine` response naming `instance_id`.
#[must_use]
pub fn deploy_response_xml(instance_id: &str) -> String {
    format!(
        "<deployvirtualmachineresponse><id>{instance_id}</id>\
         <jobid>job-{instance_id}</jobid></deployvirtualmachineresponse>"
    )
}

/// A `listVirtualMachines` response holding `(id, state)` pairs.
#[must_use]
pub fn vm_list_xml(machines: &[(&str, &str)]) -> String {
    let items: String = machines
        .iter()
        .map(|(id, state)| {
            format!(
                "<virtualmachine><id>{id}</id><displayname>vm-{id}</displayname>\
                 <state>{state}</state><zoneid>{TEST_REGION}</zoneid></virtualmachine>"
            )
        })
        .collect();
    format!(
        "<listvirtualmachinesresponse><count>{}</count>{items}</listvirtualmachinesresponse>",
        machines.len()
    )
}

/// A `listServiceOfferings` response holding `(id, name, cpus, memory_mb)`.
#[must_use]
pub fn offerings_xml(offerings: &[(&str, &str, u32, u32)]) -> String {
    let items: String = offerings
        .iter()
        .map(|(id, name, cpus, memory)| {
            format!(
                "<serviceoffering><id>{id}</id><name>{name}</name>\
                 <cpunumber>{cpus}</cpunumber><memory>{memory}</memory></serviceoffering>"
            )
        })
        .collect();
    format!("<listserviceofferingsresponse>{items}</listserviceofferingsresponse>")
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes variables while holding the global mutex, restoring them on
    /// drop.
    pub async fn remove_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
