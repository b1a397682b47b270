//! Machine resource and its role protocol

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::provider::{AwsMachineProviderSpec, AwsMachineProviderStatus};
use crate::{LABEL_CLUSTER_NAME, LABEL_ROLE, ROLE_CONTROL_PLANE};

/// Kubernetes component versions requested for a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersionInfo {
    /// Kubelet version
    pub kubelet: String,
    /// Control plane version, empty on workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<String>,
}

/// Specification for a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Provider-specific desired configuration
    #[serde(default)]
    pub provider_spec: AwsMachineProviderSpec,

    /// Identifier of the backing instance, as seen by the node's cloud provider
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Requested component versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<MachineVersionInfo>,
}

/// Observed state of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Provider-specific observed state
    #[serde(default)]
    pub provider_status: AwsMachineProviderStatus,
}

/// Role a machine plays in its cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineRole {
    /// Runs the cluster's management components
    ControlPlane,
    /// Runs workloads only
    Worker,
}

impl MachineRole {
    /// Translate the role label into a role
    pub fn from_label(value: Option<&str>) -> Self {
        if value == Some(ROLE_CONTROL_PLANE) {
            Self::ControlPlane
        } else {
            Self::Worker
        }
    }

    /// True for control plane machines
    pub fn is_control_plane(self) -> bool {
        self == Self::ControlPlane
    }
}

impl Machine {
    /// Role derived from the machine's labels
    pub fn role(&self) -> MachineRole {
        MachineRole::from_label(self.labels().get(LABEL_ROLE).map(String::as_str))
    }

    /// True once a deletion timestamp has been set
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Name of the owning cluster, from the cluster-name label
    pub fn cluster_name(&self) -> Option<&str> {
        self.labels().get(LABEL_CLUSTER_NAME).map(String::as_str)
    }

    /// "namespace/name" for log and error messages
    pub fn qualified_name(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}

/// Provider id for an instance, e.g. `aws:////i-0abc123`
pub fn provider_id_for(provider: &str, instance_id: &str) -> String {
    format!("{}:////{}", provider, instance_id)
}
