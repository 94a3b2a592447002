//! Single round-trip instance operations.

use tracing::{debug, instrument};

use crate::model::VirtualMachineRecord;

use super::response::{Element, ResponseDocument};
use super::services::{ApiAction, Param};
use super::{CloudStackCompute, CloudStackError};

const PAUSE_JOB_LABEL: &str = "Pause Server";

fn node_id(node: &Element) -> Option<&str> {
    node.children()
        .iter()
        .find(|child| child.is_named("id") || child.is_named("virtualmachineid"))
        .and_then(Element::text)
        .map(str::trim)
}

impl CloudStackCompute {
    #[instrument(skip(self))]
    pub(super) async fn list_all(&self) -> Result<Vec<VirtualMachineRecord>, CloudStackError> {
        let params = [Param::new("zoneId", self.region()?)];
        let doc = self
            .collaborators
            .transport
            .invoke(ApiAction::ListVirtualMachines, &params)
            .await?;
        let mut records = Vec::new();
        for node in doc.elements_named("virtualmachine") {
            if let Some(record) = self.parse_instance(node).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Decodes only the listed node carrying `instance_id`, so a sibling in
    /// an unknown state cannot fail the lookup.
    #[instrument(skip(self))]
    pub(super) async fn fetch_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<VirtualMachineRecord>, CloudStackError> {
        let params = [Param::new("zoneId", self.region()?)];
        let doc = self
            .collaborators
            .transport
            .invoke(ApiAction::ListVirtualMachines, &params)
            .await?;
        let Some(node) = doc
            .elements_named("virtualmachine")
            .into_iter()
            .find(|node| node_id(node) == Some(instance_id))
        else {
            debug!("instance not listed");
            return Ok(None);
        };
        self.parse_instance(node).await
    }

    async fn instance_action(
        &self,
        action: ApiAction,
        instance_id: &str,
    ) -> Result<ResponseDocument, CloudStackError> {
        let params = [Param::new("id", instance_id)];
        Ok(self.collaborators.transport.invoke(action, &params).await?)
    }

    #[instrument(skip(self))]
    pub(super) async fn start_instance(&self, instance_id: &str) -> Result<(), CloudStackError> {
        self.instance_action(ApiAction::StartVirtualMachine, instance_id)
            .await
            .map(drop)
    }

    /// Stop means pause on this provider; the call returns once the stop
    /// job has finished.
    #[instrument(skip(self))]
    pub(super) async fn pause_instance(&self, instance_id: &str) -> Result<(), CloudStackError> {
        let doc = self
            .instance_action(ApiAction::StopVirtualMachine, instance_id)
            .await?;
        self.collaborators
            .jobs
            .await_completion(&doc, PAUSE_JOB_LABEL)
            .await
    }

    #[instrument(skip(self))]
    pub(super) async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudStackError> {
        self.instance_action(ApiAction::RebootVirtualMachine, instance_id)
            .await
            .map(drop)
    }

    #[instrument(skip(self))]
    pub(super) async fn destroy_instance(&self, instance_id: &str) -> Result<(), CloudStackError> {
        self.instance_action(ApiAction::DestroyVirtualMachine, instance_id)
            .await
            .map(drop)
    }

    pub(super) async fn firewalls_for(
        &self,
        instance_id: &str,
    ) -> Result<Vec<String>, CloudStackError> {
        match self.collaborators.firewalls.as_ref() {
            Some(firewalls) => firewalls.list_firewalls_for_vm(instance_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// 401, 403 and 531 mean "not subscribed"; other failures propagate.
    pub(super) async fn probe_subscription(&self) -> Result<bool, CloudStackError> {
        let params = [Param::new("available", "true")];
        match self
            .collaborators
            .transport
            .invoke(ApiAction::ListZones, &params)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_unsubscribed() => {
                debug!(status = err.status, "account is not subscribed");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
