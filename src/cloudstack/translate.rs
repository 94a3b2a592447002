//! Translation of `virtualmachine` response elements into canonical records.
//!
//! Each child element is decoded once into a [`VmField`], folded into a
//! [`VmDraft`], and the draft is normalized into a
//! [`VirtualMachineRecord`]. The offering is attached last because the
//! catalog lookup needs the architecture.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::model::{
    Architecture, Capabilities, Platform, RootCredential, VirtualMachineRecord, VmState,
};

use super::response::Element;
use super::types::{InstanceId, NetworkId, ZoneId};
use super::{CloudStackCompute, CloudStackError};

const CREATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Whether `address` belongs to 10/8, 172.16/12 or 192.168/16.
///
/// The 172 block is checked by second octet so that odd inputs classify the
/// same way they always have: wrong octet counts and unparsable octets are
/// public.
pub(crate) fn is_private_address(address: &str) -> bool {
    if address.starts_with("10.") || address.starts_with("192.168.") {
        return true;
    }
    if !address.starts_with("172.") {
        return false;
    }
    let octets: Vec<&str> = address.split('.').collect();
    if octets.len() != 4 {
        return false;
    }
    octets
        .get(1)
        .and_then(|octet| octet.parse::<u8>().ok())
        .is_some_and(|second| (16..=31).contains(&second))
}

/// Maps a provider lifecycle value. `Ok(None)` means the instance is in the
/// provider's error state and must be left out of results.
pub(crate) fn map_state(raw: &str) -> Result<Option<VmState>, CloudStackError> {
    let state = match raw.to_ascii_lowercase().as_str() {
        "stopped" => VmState::Paused,
        "running" => VmState::Running,
        "stopping" | "migrating" | "ha" => VmState::Rebooting,
        "starting" | "creating" => VmState::Pending,
        "destroyed" | "expunging" => VmState::Terminated,
        "error" => return Ok(None),
        _ => {
            return Err(CloudStackError::UnexpectedState {
                state: raw.to_owned(),
            });
        }
    };
    Ok(Some(state))
}

/// Every field name the translator understands.
enum VmField<'a> {
    Id(Option<&'a str>),
    Description(Option<&'a str>),
    DisplayName(Option<&'a str>),
    LegacyAddress(Option<&'a str>),
    Password(Option<&'a str>),
    Nic(&'a Element),
    OsArchitecture(Option<&'a str>),
    Created(Option<&'a str>),
    State(Option<&'a str>),
    Zone(Option<&'a str>),
    TemplateId(Option<&'a str>),
    TemplateName(Option<&'a str>),
    OfferingId(Option<&'a str>),
    Other(String, Option<&'a str>),
}

impl<'a> VmField<'a> {
    fn decode(element: &'a Element) -> Self {
        let value = element.text();
        match element.name().to_ascii_lowercase().as_str() {
            "id" | "virtualmachineid" => Self::Id(value),
            "name" => Self::Description(value),
            "displayname" => Self::DisplayName(value),
            "ipaddress" => Self::LegacyAddress(value),
            "password" => Self::Password(value),
            "nic" => Self::Nic(element),
            "osarchitecture" => Self::OsArchitecture(value),
            "created" => Self::Created(value),
            "state" => Self::State(value),
            "zoneid" => Self::Zone(value),
            "templateid" => Self::TemplateId(value),
            "templatename" => Self::TemplateName(value),
            "serviceofferingid" => Self::OfferingId(value),
            other => Self::Other(other.to_owned(), value),
        }
    }
}

/// Intermediate record; everything optional until normalization.
#[derive(Default)]
struct VmDraft {
    id: Option<InstanceId>,
    name: Option<String>,
    description: Option<String>,
    architecture: Architecture,
    state: VmState,
    zone: Option<ZoneId>,
    network: Option<NetworkId>,
    public_addresses: Vec<String>,
    private_addresses: Vec<String>,
    public_dns: Option<String>,
    private_dns: Option<String>,
    root_credential: Option<RootCredential>,
    image_id: Option<String>,
    platform: Platform,
    offering_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    last_boot_at: Option<DateTime<Utc>>,
    capabilities: Capabilities,
    tags: BTreeMap<String, String>,
}

impl VmDraft {
    /// Folds one field in. Returns `Ok(false)` when the instance must be
    /// dropped.
    fn apply(&mut self, field: VmField<'_>) -> Result<bool, CloudStackError> {
        match field {
            VmField::Id(value) => self.id = value.map(InstanceId::from),
            VmField::Description(value) => self.description = value.map(str::to_owned),
            VmField::DisplayName(value) => self.name = value.map(str::to_owned),
            VmField::LegacyAddress(value) => {
                self.private_addresses = value.map(str::to_owned).into_iter().collect();
                self.private_dns = value.map(str::to_owned);
            }
            VmField::Password(value) => self.root_credential = value.map(RootCredential::new),
            VmField::Nic(nic) => self.apply_nic(nic),
            VmField::OsArchitecture(value) => {
                self.architecture = Architecture::from_provider(value);
            }
            VmField::Created(value) => self.apply_created(value),
            VmField::State(value) => {
                let raw = value.unwrap_or_default();
                let Some(state) = map_state(raw)? else {
                    let instance_id = self.id.as_ref().map(InstanceId::as_str);
                    warn!(?instance_id, "instance is in an error state; skipping");
                    return Ok(false);
                };
                if state == VmState::Paused {
                    self.capabilities.imagable = true;
                }
                self.state = state;
            }
            VmField::Zone(value) => self.zone = value.map(ZoneId::from),
            VmField::TemplateId(value) => self.image_id = value.map(str::to_owned),
            VmField::TemplateName(value) => {
                self.platform = Platform::guess(value.unwrap_or_default());
            }
            VmField::OfferingId(value) => self.offering_id = value.map(str::to_owned),
            VmField::Other(name, Some(value)) => {
                self.tags.insert(name, value.to_owned());
            }
            VmField::Other(_, None) => {}
        }
        Ok(true)
    }

    fn apply_nic(&mut self, nic: &Element) {
        if self.network.is_none() {
            self.network = nic
                .child("networkid")
                .and_then(Element::text)
                .map(|id| NetworkId::from(id.trim()));
        }
        let Some(address) = nic
            .child("ipaddress")
            .and_then(Element::text)
            .map(str::trim)
        else {
            return;
        };
        if is_private_address(address) {
            self.private_addresses.push(address.to_owned());
            if self.private_dns.is_none() {
                self.private_dns = Some(address.to_owned());
            }
        } else {
            self.public_addresses.push(address.to_owned());
            if self.public_dns.is_none() {
                self.public_dns = Some(address.to_owned());
            }
        }
    }

    fn apply_created(&mut self, value: Option<&str>) {
        let parsed =
            value.and_then(|raw| DateTime::parse_from_str(raw.trim(), CREATED_FORMAT).ok());
        if let Some(created) = parsed {
            self.created_at = Some(created.with_timezone(&Utc));
        } else {
            warn!(value = ?value, "invalid creation time");
            self.last_boot_at = Some(DateTime::<Utc>::default());
        }
    }

    fn finish(
        self,
        region_id: Option<&str>,
        owner_id: Option<&str>,
    ) -> Result<(VirtualMachineRecord, Option<String>), CloudStackError> {
        let id = self.id.ok_or_else(|| {
            CloudStackError::MalformedResponse(String::from("virtual machine has no id"))
        })?;
        let name = self.name.unwrap_or_else(|| id.to_string());
        let description = self.description.unwrap_or_else(|| name.clone());
        let zone = self
            .zone
            .map(|zone| zone.to_string())
            .or_else(|| region_id.map(str::to_owned))
            .unwrap_or_default();
        let record = VirtualMachineRecord {
            id: id.to_string(),
            name,
            description,
            architecture: self.architecture,
            state: self.state,
            region_id: zone.clone(),
            datacenter_id: zone,
            network_id: self.network.map(|network| network.to_string()),
            public_addresses: self.public_addresses,
            private_addresses: self.private_addresses,
            public_dns: self.public_dns,
            private_dns: self.private_dns,
            root_credential: self.root_credential,
            image_id: self.image_id,
            platform: self.platform,
            product: None,
            owner_id: owner_id.map(str::to_owned),
            created_at: self.created_at,
            last_boot_at: self.last_boot_at,
            tags: self.tags,
            capabilities: self.capabilities,
        };
        Ok((record, self.offering_id))
    }
}

/// Decodes one `virtualmachine` element without touching the catalog.
/// Returns the record and the offering id still to be resolved, or `None`
/// when the instance is in the error state.
pub(crate) fn decode_instance(
    node: &Element,
    region_id: Option<&str>,
    owner_id: Option<&str>,
) -> Result<Option<(VirtualMachineRecord, Option<String>)>, CloudStackError> {
    let mut draft = VmDraft::default();
    for child in node.children() {
        if !draft.apply(VmField::decode(child))? {
            return Ok(None);
        }
    }
    draft.finish(region_id, owner_id).map(Some)
}

impl CloudStackCompute {
    pub(super) async fn parse_instance(
        &self,
        node: &Element,
    ) -> Result<Option<VirtualMachineRecord>, CloudStackError> {
        let Some((mut record, offering_id)) = decode_instance(
            node,
            self.context.region_id.as_deref(),
            self.context.account_number.as_deref(),
        )?
        else {
            return Ok(None);
        };
        if let Some(offering_id) = offering_id {
            record.product = self
                .products_for(record.architecture)
                .await?
                .into_iter()
                .find(|product| product.id == offering_id);
        }
        Ok(Some(record))
    }
}
