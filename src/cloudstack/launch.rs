//! Instance provisioning: request assembly, network candidate retry and
//! hand-off to materialization.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, instrument, warn};

use crate::backend::{LaunchRequest, Tag};
use crate::config::ApiVersion;
use crate::model::VirtualMachineRecord;

use super::response::{Element, ResponseDocument};
use super::services::{ApiAction, Param};
use super::types::{InstanceId, NetworkId, ZoneId};
use super::{CloudStackCompute, CloudStackError, ProviderErrorKind};

const DEFAULT_USER_DATA: &str = "created=cloudstack-vm\n";

/// Flattens tags into `key=value` lines and base64 encodes them. Without
/// tags a single marker line is sent.
pub(crate) fn encode_user_data(tags: &[Tag]) -> String {
    let text = if tags.is_empty() {
        String::from(DEFAULT_USER_DATA)
    } else {
        tags.iter()
            .map(|tag| format!("{}={}\n", tag.key, tag.value))
            .collect()
    };
    STANDARD.encode(text)
}

/// Joins security group ids with commas, dropping blank entries.
pub(crate) fn join_firewalls(firewall_ids: &[String]) -> Option<String> {
    let joined = firewall_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>()
        .join(",");
    (!joined.is_empty()).then_some(joined)
}

/// Pulls the new instance id out of a deploy response.
pub(crate) fn extract_instance_id(
    response: &ResponseDocument,
) -> Result<InstanceId, CloudStackError> {
    response
        .elements_named("deployvirtualmachineresponse")
        .into_iter()
        .find_map(|deploy| {
            deploy
                .children()
                .iter()
                .find(|child| child.is_named("virtualmachineid") || child.is_named("id"))
                .and_then(Element::text)
        })
        .map(|id| InstanceId::from(id.trim()))
        .ok_or(CloudStackError::LaunchRejected)
}

impl CloudStackCompute {
    #[instrument(
        skip(self, request),
        fields(image_id = %request.image_id, product_id = %request.product_id, zone = ?request.zone)
    )]
    pub(super) async fn launch_instance(
        &self,
        request: &LaunchRequest,
    ) -> Result<VirtualMachineRecord, CloudStackError> {
        request.validate()?;
        self.region()?;
        debug!(description = %request.description, name = %request.name, "launching instance");
        match self.context.api_version {
            ApiVersion::V2_1 => self.launch_legacy(request).await,
            ApiVersion::V2_2 => self.launch_with_candidates(request).await,
        }
    }

    /// Maps a datacenter id onto its owning region. Unknown ids pass through
    /// unchanged; no id selects the first region.
    async fn resolve_zone(&self, zone: Option<&str>) -> Result<ZoneId, CloudStackError> {
        let directory = &self.collaborators.directory;
        let regions = directory.list_regions().await?;
        let Some(requested) = zone else {
            return regions
                .first()
                .map(|region| ZoneId::from(region.id.as_str()))
                .ok_or(CloudStackError::NoRegionAvailable);
        };
        for region in &regions {
            let datacenters = directory.list_datacenters(&region.id).await?;
            if datacenters.iter().any(|dc| dc.id == requested) {
                return Ok(ZoneId::from(region.id.as_str()));
            }
        }
        Ok(ZoneId::from(requested))
    }

    async fn free_networks(&self, zone: &ZoneId) -> Result<Vec<NetworkId>, CloudStackError> {
        let Some(networks) = self.collaborators.networks.as_ref() else {
            return Ok(Vec::new());
        };
        if !networks.is_subscribed().await? {
            return Ok(Vec::new());
        }
        if !self
            .collaborators
            .capabilities
            .requires_network(zone.as_str())
            .await?
        {
            return Ok(Vec::new());
        }
        let free = networks.find_free_networks().await?;
        Ok(free.into_iter().map(NetworkId::from).collect())
    }

    async fn launch_legacy(
        &self,
        request: &LaunchRequest,
    ) -> Result<VirtualMachineRecord, CloudStackError> {
        let zone = self.resolve_zone(request.zone.as_deref()).await?;
        let params = [
            Param::new("zoneId", zone.as_str()),
            Param::new("serviceOfferingId", request.product_id.as_str()),
            Param::new("templateId", request.image_id.as_str()),
            Param::new("displayName", request.name.as_str()),
        ];
        let response = self
            .collaborators
            .transport
            .invoke(ApiAction::DeployVirtualMachine, &params)
            .await?;
        self.finish_launch(&response).await
    }

    async fn launch_with_candidates(
        &self,
        request: &LaunchRequest,
    ) -> Result<VirtualMachineRecord, CloudStackError> {
        let zone = self.resolve_zone(request.zone.as_deref()).await?;

        let fixed_network = self
            .overrides
            .network_for(&self.context.endpoint, &request.product_id)
            .await
            .or_else(|| request.network_hint.clone())
            .filter(|network| !network.is_empty())
            .map(NetworkId::from);
        let candidates = match fixed_network {
            Some(network) => vec![network],
            None => self.free_networks(&zone).await?,
        };

        let mut security_groups = join_firewalls(&request.firewall_ids);
        if security_groups.is_some()
            && !self
                .collaborators
                .capabilities
                .supports_security_groups(zone.as_str(), candidates.is_empty())
                .await?
        {
            debug!(zone = %zone, "zone does not support security groups; dropping them");
            security_groups = None;
        }

        let mut params = vec![
            Param::new("zoneId", zone.as_str()),
            Param::new("serviceOfferingId", request.product_id.as_str()),
            Param::new("templateId", request.image_id.as_str()),
            Param::new("displayName", request.name.as_str()),
            Param::new("userdata", encode_user_data(&request.tags)),
        ];
        if let Some(key_pair) = &request.key_pair {
            params.push(Param::new("keypair", key_pair.as_str()));
        }
        if let Some(groups) = security_groups {
            params.push(Param::new("securitygroupids", groups));
        }

        if candidates.is_empty() {
            let response = self
                .collaborators
                .transport
                .invoke(ApiAction::DeployVirtualMachine, &params)
                .await?;
            return self.finish_launch(&response).await;
        }

        for (attempt, network) in candidates.iter().enumerate() {
            let mut attempt_params = params.clone();
            attempt_params.push(Param::new("networkIds", network.as_str()));
            match self
                .collaborators
                .transport
                .invoke(ApiAction::DeployVirtualMachine, &attempt_params)
                .await
            {
                Ok(response) => return self.finish_launch(&response).await,
                Err(err) if err.kind == ProviderErrorKind::InsufficientCapacity => {
                    warn!(
                        network_id = %network,
                        attempt = attempt + 1,
                        error = %err,
                        "network has no free addresses; trying next candidate"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(CloudStackError::NoViableNetwork {
            tried: candidates.len(),
        })
    }

    async fn finish_launch(
        &self,
        response: &ResponseDocument,
    ) -> Result<VirtualMachineRecord, CloudStackError> {
        let instance_id = extract_instance_id(response)?;
        debug!(instance_id = %instance_id, "deploy accepted");
        self.materialize(response, &instance_id).await
    }
}
