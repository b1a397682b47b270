//! Common types for Keel: resources, errors, and Kubernetes helpers

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Cluster annotation set once network and load balancer exist
pub const ANNOTATION_INFRASTRUCTURE_READY: &str = "infrastructure-ready";

/// Cluster annotation set once the first control plane machine has initialised
pub const ANNOTATION_CONTROL_PLANE_READY: &str = "control-plane-ready";

/// Value of the readiness annotations when set
pub const VALUE_READY: &str = "ready";

/// Machine label carrying the machine's role
pub const LABEL_ROLE: &str = "role";

/// Role label value for control plane machines
pub const ROLE_CONTROL_PLANE: &str = "controlplane";

/// Machine label naming the owning cluster
pub const LABEL_CLUSTER_NAME: &str = "cluster.k8s.io/cluster-name";

/// Namespace holding kubeadm bootstrap token secrets on a workload cluster
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
