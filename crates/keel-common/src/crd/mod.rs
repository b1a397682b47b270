//! Resource definitions consumed and produced by the machine actuator
//!
//! `Cluster` and `Machine` are the orchestration framework's resources; this
//! crate only reads their specs and the status fields that link a Machine to
//! its cloud instance. `Instance` is the cloud-side view and is never
//! persisted in Kubernetes.

mod cluster;
mod instance;
mod machine;
mod provider;

pub use cluster::{ApiEndpoint, Cluster, ClusterReadiness, ClusterSpec, ClusterStatus};
pub use instance::{Instance, InstanceState};
pub use machine::{
    provider_id_for, Machine, MachineRole, MachineSpec, MachineStatus, MachineVersionInfo,
};
pub use provider::{
    AwsMachineProviderSpec, AwsMachineProviderStatus, AwsResourceReference, ResourceFilter,
};
