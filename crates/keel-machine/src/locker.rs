//! Control plane init lock
//!
//! Exactly one reconciliation per cluster may initialise the control plane;
//! every other control plane machine joins. Acquisition is one-shot: there is
//! no release, the winner's progress is observed afterwards through the
//! cluster's control-plane-ready annotation.
//!
//! # Atomicity
//!
//! The ConfigMap adapter relies on the API server rejecting a second create of
//! the same object with 409 Conflict, so two racing reconcilers cannot both
//! observe success.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use keel_common::crd::Cluster;
use keel_common::kube_utils::is_conflict;

/// Label put on lock ConfigMaps so they can be found and garbage collected
pub const LOCK_LABEL_KEY: &str = "keel.dev/control-plane-init-lock";

/// One-shot, per-cluster mutex deciding which machine initialises the control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneInitLocker: Send + Sync {
    /// Claim the init right for `cluster`
    ///
    /// Returns true only for the first caller per cluster. Failures to reach
    /// the backing store are reported as "not acquired".
    async fn acquire(&self, cluster: &Cluster) -> bool;
}

/// Name of the lock ConfigMap for a cluster
pub fn lock_name(cluster: &Cluster) -> String {
    format!("{}-controlplane", cluster.name_any())
}

/// Build the ConfigMap whose existence represents a held init lock
///
/// Owned by the Cluster so it disappears with it.
pub fn lock_configmap(cluster: &Cluster) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(lock_name(cluster)),
            namespace: cluster.namespace(),
            labels: Some(BTreeMap::from([(
                LOCK_LABEL_KEY.to_string(),
                cluster.name_any(),
            )])),
            owner_references: cluster.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Init lock backed by a ConfigMap in the cluster's namespace
pub struct ConfigMapInitLocker {
    client: Client,
}

impl ConfigMapInitLocker {
    /// Create a new locker using the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ControlPlaneInitLocker for ConfigMapInitLocker {
    async fn acquire(&self, cluster: &Cluster) -> bool {
        let name = lock_name(cluster);
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);

        match api.get_opt(&name).await {
            Ok(Some(_)) => {
                debug!(cluster = %cluster.name_any(), lock = %name, "init lock already held");
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(cluster = %cluster.name_any(), lock = %name, error = %e, "failed to read init lock");
                return false;
            }
        }

        match api.create(&PostParams::default(), &lock_configmap(cluster)).await {
            Ok(_) => {
                info!(cluster = %cluster.name_any(), lock = %name, "acquired control plane init lock");
                true
            }
            Err(e) if is_conflict(&e) => {
                debug!(cluster = %cluster.name_any(), lock = %name, "lost init lock creation race");
                false
            }
            Err(e) => {
                warn!(cluster = %cluster.name_any(), lock = %name, error = %e, "failed to create init lock");
                false
            }
        }
    }
}

/// Process-local init lock
///
/// Only correct when a single actuator replica reconciles a given cluster.
#[derive(Debug, Default)]
pub struct InMemoryInitLocker {
    claimed: DashMap<String, ()>,
}

impl InMemoryInitLocker {
    /// Create an empty locker
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ControlPlaneInitLocker for InMemoryInitLocker {
    async fn acquire(&self, cluster: &Cluster) -> bool {
        let key = format!(
            "{}/{}",
            cluster.namespace().unwrap_or_default(),
            cluster.name_any()
        );
        // DashMap::insert is atomic per key: only the first caller sees None
        let acquired = self.claimed.insert(key, ()).is_none();
        if acquired {
            info!(cluster = %cluster.name_any(), "acquired control plane init lock");
        }
        acquired
    }
}
