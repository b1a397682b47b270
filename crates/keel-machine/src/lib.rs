//! Keel machine actuator
//!
//! Converges a cloud instance toward each declared Machine and coordinates
//! which control plane machine initialises a new cluster.
//!
//! The [`Actuator`] composes narrow collaborator traits. Those that live in
//! Kubernetes ship with kube-backed implementations here; the cloud-side
//! [`InstanceService`] and [`LoadBalancerService`] are provided by the
//! provider integration.

#![deny(missing_docs)]

pub mod accessor;
pub mod actuator;
pub mod client;
pub mod config;
pub mod elb;
pub mod ensure;
pub mod instance;
pub mod join;
pub mod locker;
pub mod outdated;
pub mod scope;
pub mod token;

#[cfg(test)]
mod testing;

pub use accessor::{ClusterAccessor, KubeClusterAccessor};
pub use actuator::{Actuator, ActuatorParams, MachineActuator};
pub use client::{KubeMachineClient, MachineClient};
pub use config::ActuatorConfig;
pub use elb::LoadBalancerService;
pub use instance::InstanceService;
pub use join::NodeBootstrap;
pub use locker::{ConfigMapInitLocker, ControlPlaneInitLocker, InMemoryInitLocker};
pub use scope::MachineScope;
pub use token::{BootstrapToken, ControlPlaneEndpoint, KubeTokenIssuer, TokenIssuer};
