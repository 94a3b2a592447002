//! Contracts for the services the compute core calls but does not own.
//!
//! HTTP signing, job polling, the region directory, VLAN allocation and
//! security groups all live elsewhere in the driver. The core only sees
//! these traits, which keeps it testable with scripted doubles.

use std::fmt;
use std::sync::Arc;

use crate::backend::BackendFuture;

use super::response::ResponseDocument;
use super::{CloudStackError, ProviderError};

/// API commands issued by the compute core.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ApiAction {
    /// `deployVirtualMachine`
    DeployVirtualMachine,
    /// `destroyVirtualMachine`
    DestroyVirtualMachine,
    /// `listVirtualMachines`
    ListVirtualMachines,
    /// `listServiceOfferings`
    ListServiceOfferings,
    /// `listZones`
    ListZones,
    /// `rebootVirtualMachine`
    RebootVirtualMachine,
    /// `startVirtualMachine`
    StartVirtualMachine,
    /// `stopVirtualMachine`
    StopVirtualMachine,
}

impl ApiAction {
    /// Command name as sent on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeployVirtualMachine => "deployVirtualMachine",
            Self::DestroyVirtualMachine => "destroyVirtualMachine",
            Self::ListVirtualMachines => "listVirtualMachines",
            Self::ListServiceOfferings => "listServiceOfferings",
            Self::ListZones => "listZones",
            Self::RebootVirtualMachine => "rebootVirtualMachine",
            Self::StartVirtualMachine => "startVirtualMachine",
            Self::StopVirtualMachine => "stopVirtualMachine",
        }
    }
}

impl fmt::Display for ApiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One query parameter of an API call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Parameter value, unencoded.
    pub value: String,
}

impl Param {
    /// Creates a parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Signed request/response channel to the API endpoint.
pub trait Transport: Send + Sync {
    /// Issues `action` with `params` and returns the parsed response.
    /// Failures carry the HTTP status and a recoverability tag.
    fn invoke<'a>(
        &'a self,
        action: ApiAction,
        params: &'a [Param],
    ) -> BackendFuture<'a, ResponseDocument, ProviderError>;
}

/// Waits for asynchronous jobs referenced by a response.
pub trait JobWaiter: Send + Sync {
    /// Blocks until the job named in `response` finishes or fails.
    fn await_completion<'a>(
        &'a self,
        response: &'a ResponseDocument,
        label: &'a str,
    ) -> BackendFuture<'a, (), CloudStackError>;
}

/// A provider region.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    /// Region identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// A datacenter within a region.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataCenter {
    /// Datacenter identifier.
    pub id: String,
    /// Owning region.
    pub region_id: String,
    /// Display name.
    pub name: String,
}

/// Region and datacenter listing.
pub trait DataCenterDirectory: Send + Sync {
    /// Lists regions in provider order.
    fn list_regions(&self) -> BackendFuture<'_, Vec<Region>, CloudStackError>;

    /// Lists the datacenters of a region.
    fn list_datacenters<'a>(
        &'a self,
        region_id: &'a str,
    ) -> BackendFuture<'a, Vec<DataCenter>, CloudStackError>;
}

/// Per-zone networking capability queries.
pub trait ZoneCapabilities: Send + Sync {
    /// Whether instances in the zone must be placed on a network.
    fn requires_network<'a>(&'a self, zone_id: &'a str) -> BackendFuture<'a, bool, CloudStackError>;

    /// Whether the zone accepts security groups. `basic_network` is true
    /// when the launch will not name a network.
    fn supports_security_groups<'a>(
        &'a self,
        zone_id: &'a str,
        basic_network: bool,
    ) -> BackendFuture<'a, bool, CloudStackError>;
}

/// VLAN allocation.
pub trait NetworkService: Send + Sync {
    /// Whether the account may use network services.
    fn is_subscribed(&self) -> BackendFuture<'_, bool, CloudStackError>;

    /// Networks that currently have room for another instance, best first.
    fn find_free_networks(&self) -> BackendFuture<'_, Vec<String>, CloudStackError>;
}

/// Security group lookups.
pub trait FirewallService: Send + Sync {
    /// Security groups attached to an instance.
    fn list_firewalls_for_vm<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, Vec<String>, CloudStackError>;
}

/// The set of collaborators a compute service talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// API channel.
    pub transport: Arc<dyn Transport>,
    /// Job waiter.
    pub jobs: Arc<dyn JobWaiter>,
    /// Region directory.
    pub directory: Arc<dyn DataCenterDirectory>,
    /// Zone capability queries.
    pub capabilities: Arc<dyn ZoneCapabilities>,
    /// VLAN support, when the deployment has it.
    pub networks: Option<Arc<dyn NetworkService>>,
    /// Security group support, when the deployment has it.
    pub firewalls: Option<Arc<dyn FirewallService>>,
}
