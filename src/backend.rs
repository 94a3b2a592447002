//! Backend abstraction for provisioning and managing virtual machines.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::model::{Architecture, ProductOffering, VirtualMachineRecord};

/// A free-form key/value pair attached to a launch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Creates a tag.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Parameters required to launch a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Provider image (template) identifier.
    pub image_id: String,
    /// Offering identifier selecting CPU and memory.
    pub product_id: String,
    /// Target zone or datacenter. When absent the first region is used.
    pub zone: Option<String>,
    /// Display name for the new instance.
    pub name: String,
    /// Human readable description. The provider has no slot for it on
    /// create, so it only feeds logging.
    pub description: String,
    /// SSH key pair registered with the provider.
    pub key_pair: Option<String>,
    /// Preferred network; may be replaced by a configured override.
    pub network_hint: Option<String>,
    /// Security group identifiers to apply when the zone supports them.
    pub firewall_ids: Vec<String>,
    /// Tags passed to the instance as user-data.
    pub tags: Vec<Tag>,
}

impl LaunchRequest {
    /// Starts a builder for a [`LaunchRequest`].
    #[must_use]
    pub fn builder() -> LaunchRequestBuilder {
        LaunchRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the image, product or name
    /// is empty.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.image_id.is_empty() {
            return Err(BackendError::Validation("image_id".to_owned()));
        }
        if self.product_id.is_empty() {
            return Err(BackendError::Validation("product_id".to_owned()));
        }
        if self.name.is_empty() {
            return Err(BackendError::Validation("name".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`LaunchRequest`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchRequestBuilder {
    image_id: String,
    product_id: String,
    zone: Option<String>,
    name: String,
    description: String,
    key_pair: Option<String>,
    network_hint: Option<String>,
    firewall_ids: Vec<String>,
    tags: Vec<Tag>,
}

impl LaunchRequestBuilder {
    /// Creates an empty builder; required fields must be set before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image identifier.
    #[must_use]
    pub fn image_id(mut self, value: impl Into<String>) -> Self {
        self.image_id = value.into();
        self
    }

    /// Sets the offering identifier.
    #[must_use]
    pub fn product_id(mut self, value: impl Into<String>) -> Self {
        self.product_id = value.into();
        self
    }

    /// Sets the target zone.
    #[must_use]
    pub fn zone(mut self, value: Option<String>) -> Self {
        self.zone = value;
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, value: impl Into<String>) -> Self {
        self.description = value.into();
        self
    }

    /// Sets the key pair.
    #[must_use]
    pub fn key_pair(mut self, value: Option<String>) -> Self {
        self.key_pair = value;
        self
    }

    /// Sets the preferred network.
    #[must_use]
    pub fn network_hint(mut self, value: Option<String>) -> Self {
        self.network_hint = value;
        self
    }

    /// Sets the security group identifiers.
    #[must_use]
    pub fn firewall_ids(mut self, value: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.firewall_ids = value.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn tags(mut self, value: Vec<Tag>) -> Self {
        self.tags = value;
        self
    }

    /// Builds and validates the [`LaunchRequest`], trimming string inputs.
    /// Blank optional values collapse to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<LaunchRequest, BackendError> {
        let trim_optional = |value: Option<String>| {
            value
                .map(|inner| inner.trim().to_owned())
                .filter(|inner| !inner.is_empty())
        };
        let request = LaunchRequest {
            image_id: self.image_id.trim().to_owned(),
            product_id: self.product_id.trim().to_owned(),
            zone: trim_optional(self.zone),
            name: self.name.trim().to_owned(),
            description: self.description.trim().to_owned(),
            key_pair: trim_optional(self.key_pair),
            network_hint: self.network_hint.map(|value| value.trim().to_owned()),
            firewall_ids: self.firewall_ids,
            tags: self.tags,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Errors raised by provider-neutral request handling.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Operations every compute backend exposes to callers.
pub trait ComputeBackend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Launches an instance and returns it once the provider can see it.
    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> BackendFuture<'a, VirtualMachineRecord, Self::Error>;

    /// Looks up a single instance by identifier.
    fn get_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, Option<VirtualMachineRecord>, Self::Error>;

    /// Lists every instance visible in the configured region.
    fn list_instances(&self) -> BackendFuture<'_, Vec<VirtualMachineRecord>, Self::Error>;

    /// Lists the offerings available for an architecture.
    fn list_products(
        &self,
        architecture: Architecture,
    ) -> BackendFuture<'_, Vec<ProductOffering>, Self::Error>;

    /// Finds an offering by identifier across every architecture.
    fn get_product<'a>(
        &'a self,
        product_id: &'a str,
    ) -> BackendFuture<'a, Option<ProductOffering>, Self::Error>;

    /// Powers an instance on.
    fn start<'a>(&'a self, instance_id: &'a str) -> BackendFuture<'a, (), Self::Error>;

    /// Pauses an instance and waits for the provider to finish.
    fn stop<'a>(&'a self, instance_id: &'a str) -> BackendFuture<'a, (), Self::Error>;

    /// Reboots an instance.
    fn reboot<'a>(&'a self, instance_id: &'a str) -> BackendFuture<'a, (), Self::Error>;

    /// Destroys an instance.
    fn destroy<'a>(&'a self, instance_id: &'a str) -> BackendFuture<'a, (), Self::Error>;

    /// Lists the firewalls protecting an instance.
    fn list_firewalls<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, Vec<String>, Self::Error>;

    /// Reports whether the configured account may use the compute service.
    fn is_subscribed(&self) -> BackendFuture<'_, bool, Self::Error>;
}
