//! Cluster resource and its readiness protocol
//!
//! Readiness travels between controllers as annotations on the Cluster. Code
//! inside the actuator only ever sees the typed [`ClusterReadiness`]; the
//! annotation strings are translated here and nowhere else.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ANNOTATION_CONTROL_PLANE_READY, ANNOTATION_INFRASTRUCTURE_READY, VALUE_READY};

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cloud region the cluster's infrastructure lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// SSH key name used for bastion and node access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_name: Option<String>,
}

/// A reachable API server endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// DNS name or IP address of the endpoint
    pub host: String,
    /// Port the API server listens on
    pub port: i32,
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// API server endpoints, populated once the load balancer exists
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_endpoints: Vec<ApiEndpoint>,
}

/// Which bootstrap stages a cluster has reported as done
///
/// The two flags are independent: each gate reads only its own annotation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterReadiness {
    /// Infrastructure (network, load balancer) has been provisioned
    pub infrastructure: bool,
    /// A control plane is up and machines can join it
    pub control_plane: bool,
}

impl ClusterReadiness {
    /// Nothing reported yet
    pub const NOT_READY: Self = Self {
        infrastructure: false,
        control_plane: false,
    };

    /// Infrastructure exists but no control plane has finished initialising
    pub const INFRASTRUCTURE_READY: Self = Self {
        infrastructure: true,
        control_plane: false,
    };

    /// Both stages reported
    pub const CONTROL_PLANE_READY: Self = Self {
        infrastructure: true,
        control_plane: true,
    };

    /// Translate the wire annotations into readiness flags
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let is_ready = |key: &str| annotations.get(key).map(String::as_str) == Some(VALUE_READY);

        Self {
            infrastructure: is_ready(ANNOTATION_INFRASTRUCTURE_READY),
            control_plane: is_ready(ANNOTATION_CONTROL_PLANE_READY),
        }
    }

    /// Wire annotations that represent these flags
    pub fn to_annotations(self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        if self.infrastructure {
            annotations.insert(
                ANNOTATION_INFRASTRUCTURE_READY.to_string(),
                VALUE_READY.to_string(),
            );
        }
        if self.control_plane {
            annotations.insert(
                ANNOTATION_CONTROL_PLANE_READY.to_string(),
                VALUE_READY.to_string(),
            );
        }
        annotations
    }

    /// True once the cluster's infrastructure has been provisioned
    pub fn is_infrastructure_ready(self) -> bool {
        self.infrastructure
    }

    /// True once a control plane exists for machines to join
    pub fn is_control_plane_ready(self) -> bool {
        self.control_plane
    }
}

impl Cluster {
    /// Current readiness, re-read from annotations on every call
    pub fn readiness(&self) -> ClusterReadiness {
        ClusterReadiness::from_annotations(self.annotations())
    }

    /// The first advertised API server host, if any
    pub fn api_server_host(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.api_endpoints.first())
            .map(|e| e.host.as_str())
            .filter(|h| !h.is_empty())
    }
}
