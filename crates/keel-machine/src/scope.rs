//! Per-verb reconciliation scope
//!
//! A scope owns working copies of the Machine and Cluster for the duration
//! of one actuator verb. Changes to the machine are made in memory and
//! flushed once, by [`MachineScope::close`], on every completed exit path.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, warn};

use keel_common::crd::{
    AwsMachineProviderSpec, AwsMachineProviderStatus, Cluster, Instance, InstanceState, Machine,
    MachineRole,
};
use keel_common::Error;

use crate::client::MachineClient;

/// Working state for one reconciliation of one Machine
pub struct MachineScope {
    /// The owning cluster, as passed to the verb
    pub cluster: Cluster,
    /// Working copy of the machine; flushed on close
    pub machine: Machine,
    original: Machine,
    client: Arc<dyn MachineClient>,
}

impl std::fmt::Debug for MachineScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineScope")
            .field("cluster", &self.cluster.name_any())
            .field("machine", &self.machine.qualified_name())
            .finish()
    }
}

impl MachineScope {
    /// Open a scope, rejecting machines without a name or namespace
    pub fn new(
        cluster: &Cluster,
        machine: &Machine,
        client: Arc<dyn MachineClient>,
    ) -> Result<Self, Error> {
        let cluster_name = cluster.name_any();
        if machine.metadata.name.as_deref().unwrap_or_default().is_empty() {
            return Err(Error::validation_for_field(
                cluster_name,
                "metadata.name",
                "machine has no name",
            ));
        }
        if machine.namespace().unwrap_or_default().is_empty() {
            return Err(Error::validation_for_field(
                cluster_name,
                "metadata.namespace",
                format!("machine {} has no namespace", machine.name_any()),
            ));
        }

        Ok(Self {
            cluster: cluster.clone(),
            machine: machine.clone(),
            original: machine.clone(),
            client,
        })
    }

    /// Machine name
    pub fn name(&self) -> String {
        self.machine.name_any()
    }

    /// Machine namespace
    pub fn namespace(&self) -> String {
        self.machine.namespace().unwrap_or_default()
    }

    /// Cluster name
    pub fn cluster_name(&self) -> String {
        self.cluster.name_any()
    }

    /// Machine role, re-read from labels
    pub fn role(&self) -> MachineRole {
        self.machine.role()
    }

    /// Desired provider configuration
    pub fn machine_config(&self) -> &AwsMachineProviderSpec {
        &self.machine.spec.provider_spec
    }

    /// Observed provider status
    pub fn machine_status(&self) -> AwsMachineProviderStatus {
        self.machine
            .status
            .as_ref()
            .map(|s| s.provider_status.clone())
            .unwrap_or_default()
    }

    fn machine_status_mut(&mut self) -> &mut AwsMachineProviderStatus {
        &mut self
            .machine
            .status
            .get_or_insert_with(Default::default)
            .provider_status
    }

    /// Recorded instance id, if one has been recorded and is non-empty
    pub fn instance_id(&self) -> Option<String> {
        self.machine
            .status
            .as_ref()
            .and_then(|s| s.provider_status.instance_id.clone())
            .filter(|id| !id.is_empty())
    }

    /// Link the machine to `instance`
    ///
    /// A machine that already points at an instance is never re-pointed at a
    /// different one.
    pub fn record_instance(&mut self, instance: &Instance) -> Result<(), Error> {
        if let Some(existing) = self.instance_id() {
            if existing != instance.id {
                return Err(Error::validation_for_field(
                    self.cluster_name(),
                    "status.providerStatus.instanceId",
                    format!(
                        "machine {} is linked to instance {} and cannot be relinked to {}",
                        self.machine.qualified_name(),
                        existing,
                        instance.id
                    ),
                ));
            }
        }

        let status = self.machine_status_mut();
        status.instance_id = Some(instance.id.clone());
        status.instance_state = Some(instance.state);
        Ok(())
    }

    /// Record the latest observed instance state
    pub fn set_instance_state(&mut self, state: InstanceState) {
        self.machine_status_mut().instance_state = Some(state);
    }

    /// Set a machine annotation
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.machine
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
    }

    /// Read a machine annotation
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.machine.annotations().get(key).map(String::as_str)
    }

    /// Provider id currently set on the machine spec, if non-empty
    pub fn provider_id(&self) -> Option<&str> {
        self.machine
            .spec
            .provider_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    /// Set the machine's provider id
    pub fn set_provider_id(&mut self, provider_id: String) {
        self.machine.spec.provider_id = Some(provider_id);
    }

    /// List all machines of this scope's cluster
    pub async fn list_cluster_machines(&self) -> Result<Vec<Machine>, Error> {
        self.client
            .list_cluster_machines(&self.namespace(), &self.cluster_name())
            .await
    }

    /// Flush machine changes and release the scope
    ///
    /// The verb's own error takes precedence over a persistence error; the
    /// latter is logged in that case.
    pub async fn close<T>(self, result: Result<T, Error>) -> Result<T, Error> {
        let persisted = self.persist().await;
        match (result, persisted) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(persist_err)) => {
                warn!(
                    machine = %self.machine.qualified_name(),
                    error = %persist_err,
                    "failed to persist machine while handling an earlier error"
                );
                Err(e)
            }
        }
    }

    async fn persist(&self) -> Result<(), Error> {
        let metadata_changed = self.machine.metadata.annotations
            != self.original.metadata.annotations
            || self.machine.spec != self.original.spec;
        if metadata_changed {
            debug!(machine = %self.machine.qualified_name(), "persisting machine");
            self.client.update_machine(&self.machine).await?;
        }

        if self.machine.status != self.original.status {
            debug!(machine = %self.machine.qualified_name(), "persisting machine status");
            self.client.update_machine_status(&self.machine).await?;
        }

        Ok(())
    }
}
