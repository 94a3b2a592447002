//! Virtual machine support for CloudStack-style compute control planes.
//!
//! The crate maps a CloudStack XML/HTTP API onto a provider-neutral
//! [`ComputeBackend`]: launching instances with network candidate retry,
//! waiting for them to become visible, translating responses into
//! [`VirtualMachineRecord`]s, and exposing the offering catalog. Transport,
//! job polling, region lookup, VLAN and security group management are
//! supplied by the caller through the traits in [`cloudstack`].

pub mod backend;
pub mod cloudstack;
pub mod config;
pub mod model;
pub mod test_support;

pub use backend::{BackendError, ComputeBackend, LaunchRequest, LaunchRequestBuilder, Tag};
pub use cloudstack::{CloudStackCompute, CloudStackError, ProviderError, ProviderErrorKind};
pub use config::{ApiVersion, CloudStackConfig, ConfigError, MaterializeSettings, ProviderContext};
pub use model::{
    Architecture, Capabilities, Platform, ProductOffering, RootCredential, VirtualMachineRecord,
    VmState,
};
