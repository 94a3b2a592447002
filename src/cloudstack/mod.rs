//! CloudStack implementation of the compute backend.
//!
//! [`CloudStackCompute`] owns everything a tenant needs: the provider
//! context, the override tables, the offering cache and the collaborator
//! services. Caches are explicit objects; share one between services with
//! [`CloudStackCompute::with_product_cache`].

mod catalog;
mod error;
mod launch;
mod lifecycle;
mod materialize;
mod overrides;
mod response;
mod services;
mod translate;
mod types;

use std::sync::Arc;

use tracing::debug;

use crate::backend::{BackendFuture, ComputeBackend, LaunchRequest};
use crate::config::{CloudStackConfig, MaterializeSettings, ProviderContext};
use crate::model::{Architecture, ProductOffering, VirtualMachineRecord};

pub use catalog::ProductCache;
pub use error::{CloudStackError, ProviderError, ProviderErrorKind};
pub use materialize::{CancelHandle, Cancellation, Clock, SleepFuture, TokioClock};
pub use overrides::{
    CLOUD_MAPPINGS_FILE, NETWORK_MAPPINGS_FILE, OverrideSource, OverrideStore, OverrideTables,
    SERVICE_MAPPINGS_FILE,
};
pub use response::{Element, ResponseDocument};
pub use services::{
    ApiAction, Collaborators, DataCenter, DataCenterDirectory, FirewallService, JobWaiter,
    NetworkService, Param, Region, Transport, ZoneCapabilities,
};

const PROVIDER_TERM: &str = "virtual machine";

/// Compute service for one CloudStack endpoint and account.
#[derive(Clone)]
pub struct CloudStackCompute {
    collaborators: Collaborators,
    context: ProviderContext,
    overrides: Arc<OverrideStore>,
    products: Arc<ProductCache>,
    settings: MaterializeSettings,
    clock: Arc<dyn Clock>,
    cancellation: Cancellation,
}

impl CloudStackCompute {
    /// Creates a service with no overrides, a private offering cache, default
    /// polling timings and the tokio clock.
    #[must_use]
    pub fn new(context: ProviderContext, collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            context,
            overrides: Arc::new(OverrideStore::disabled()),
            products: Arc::new(ProductCache::new()),
            settings: MaterializeSettings::default(),
            clock: Arc::new(TokioClock),
            cancellation: Cancellation::never(),
        }
    }

    /// Creates a service from loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CloudStackError::Config`] when the configuration fails
    /// validation.
    pub fn from_config(
        config: &CloudStackConfig,
        collaborators: Collaborators,
    ) -> Result<Self, CloudStackError> {
        let source = config
            .overrides_dir()
            .map_or(OverrideSource::Disabled, OverrideSource::Directory);
        Ok(Self::new(config.context()?, collaborators)
            .with_overrides(Arc::new(OverrideStore::new(source)))
            .with_settings(config.materialize_settings()))
    }

    /// Replaces the override store.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Arc<OverrideStore>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Replaces the offering cache, typically to share it between services.
    #[must_use]
    pub fn with_product_cache(mut self, products: Arc<ProductCache>) -> Self {
        self.products = products;
        self
    }

    /// Replaces the polling timings.
    #[must_use]
    pub const fn with_settings(mut self, settings: MaterializeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the clock used while polling.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Links long waits to an external cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Provider context in effect.
    #[must_use]
    pub const fn context(&self) -> &ProviderContext {
        &self.context
    }

    /// Offering cache in use.
    #[must_use]
    pub const fn product_cache(&self) -> &Arc<ProductCache> {
        &self.products
    }

    fn region(&self) -> Result<&str, CloudStackError> {
        self.context.region_id.as_deref().ok_or_else(|| {
            CloudStackError::Config(String::from("no region is established for this request"))
        })
    }

    /// Cloning is not offered by the provider.
    ///
    /// # Errors
    ///
    /// Always returns [`CloudStackError::Unsupported`].
    pub fn clone_instance(
        &self,
        instance_id: &str,
    ) -> Result<VirtualMachineRecord, CloudStackError> {
        debug!(instance_id, endpoint = %self.context.endpoint, "clone requested");
        Err(CloudStackError::Unsupported(String::from(
            "instances cannot be cloned",
        )))
    }

    /// Analytics are not offered; enabling them does nothing.
    pub fn enable_analytics(&self, instance_id: &str) {
        debug!(instance_id, endpoint = %self.context.endpoint, "analytics not supported; ignoring");
    }

    /// Analytics are not offered; disabling them does nothing.
    pub fn disable_analytics(&self, instance_id: &str) {
        debug!(instance_id, endpoint = %self.context.endpoint, "analytics not supported; ignoring");
    }

    /// Always `false`.
    #[must_use]
    pub const fn supports_analytics(&self) -> bool {
        false
    }

    /// Console output is not exposed by the provider, so this is empty.
    #[must_use]
    pub fn console_output(&self, instance_id: &str) -> String {
        debug!(instance_id, endpoint = %self.context.endpoint, "console output unavailable");
        String::new()
    }

    /// What the provider calls an instance.
    #[must_use]
    pub const fn provider_term(&self) -> &'static str {
        PROVIDER_TERM
    }
}

impl ComputeBackend for CloudStackCompute {
    type Error = CloudStackError;

    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> BackendFuture<'a, VirtualMachineRecord, Self::Error> {
        Box::pin(self.launch_instance(request))
    }

    fn get_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, Option<VirtualMachineRecord>, Self::Error> {
        Box::pin(self.fetch_instance(instance_id))
    }

    fn list_instances(&self) -> BackendFuture<'_, Vec<VirtualMachineRecord>, Self::Error> {
        Box::pin(self.list_all())
    }

    fn list_products(
        &self,
        architecture: Architecture,
    ) -> BackendFuture<'_, Vec<ProductOffering>, Self::Error> {
        Box::pin(self.products_for(architecture))
    }

    fn get_product<'a>(
        &'a self,
        product_id: &'a str,
    ) -> BackendFuture<'a, Option<ProductOffering>, Self::Error> {
        Box::pin(self.find_product(product_id))
    }

    fn start<'a>(&'a self, instance_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.start_instance(instance_id))
    }

    fn stop<'a>(&'a self, instance_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.pause_instance(instance_id))
    }

    fn reboot<'a>(&'a self, instance_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.reboot_instance(instance_id))
    }

    fn destroy<'a>(&'a self, instance_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.destroy_instance(instance_id))
    }

    fn list_firewalls<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, Vec<String>, Self::Error> {
        Box::pin(self.firewalls_for(instance_id))
    }

    fn is_subscribed(&self) -> BackendFuture<'_, bool, Self::Error> {
        Box::pin(self.probe_subscription())
    }
}
