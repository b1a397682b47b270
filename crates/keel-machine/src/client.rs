//! Machine store access
//!
//! The actuator reads sibling machines to decide join vs init and writes
//! back the fields of a single machine it owns (annotations, provider id,
//! provider status). Everything else about a Machine belongs to the
//! orchestration framework.

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use keel_common::crd::Machine;
use keel_common::{Error, LABEL_CLUSTER_NAME};

const FIELD_MANAGER: &str = "keel-machine-actuator";

/// Trait abstracting Machine reads and writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// List every Machine labelled as belonging to `cluster_name`
    async fn list_cluster_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, Error>;

    /// Persist a machine's annotations and spec.providerID
    async fn update_machine(&self, machine: &Machine) -> Result<(), Error>;

    /// Persist a machine's status
    async fn update_machine_status(&self, machine: &Machine) -> Result<(), Error>;
}

/// Real Kubernetes implementation of [`MachineClient`]
pub struct KubeMachineClient {
    client: Client,
}

impl KubeMachineClient {
    /// Create a new KubeMachineClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, machine: &Machine) -> Result<Api<Machine>, Error> {
        let namespace = machine.namespace().ok_or_else(|| {
            Error::validation_for_field(
                machine.cluster_name().unwrap_or("unknown"),
                "metadata.namespace",
                format!("machine {} has no namespace", machine.name_any()),
            )
        })?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

#[async_trait]
impl MachineClient for KubeMachineClient {
    async fn list_cluster_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        let params =
            ListParams::default().labels(&format!("{}={}", LABEL_CLUSTER_NAME, cluster_name));
        let machines = api.list(&params).await?;
        debug!(cluster = %cluster_name, count = machines.items.len(), "listed cluster machines");
        Ok(machines.items)
    }

    async fn update_machine(&self, machine: &Machine) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": machine.annotations(),
            },
            "spec": {
                "providerID": machine.spec.provider_id,
            }
        });

        self.api(machine)?
            .patch(
                &machine.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn update_machine_status(&self, machine: &Machine) -> Result<(), Error> {
        let patch = serde_json::json!({
            "status": machine.status,
        });

        self.api(machine)?
            .patch_status(
                &machine.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
