//! Access to a cluster's control plane address and credentials

use async_trait::async_trait;
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use keel_common::crd::Cluster;
use keel_common::kube_utils::get_secret_data;
use keel_common::Error;

/// Key in the kubeconfig secret holding the kubeconfig YAML
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Name of the secret holding a cluster's admin kubeconfig
pub fn kubeconfig_secret_name(cluster: &Cluster) -> String {
    format!("{}-kubeconfig", cluster.name_any())
}

/// Looks up how to reach a cluster's control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterAccessor: Send + Sync {
    /// Address of the cluster's API server
    async fn get_ip(&self, cluster: &Cluster) -> Result<String, Error>;

    /// Admin kubeconfig YAML for the cluster
    async fn get_kubeconfig(&self, cluster: &Cluster) -> Result<String, Error>;
}

/// [`ClusterAccessor`] reading Cluster status and kubeconfig secrets
pub struct KubeClusterAccessor {
    client: Client,
}

impl KubeClusterAccessor {
    /// Create a new accessor using the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterAccessor for KubeClusterAccessor {
    async fn get_ip(&self, cluster: &Cluster) -> Result<String, Error> {
        cluster.api_server_host().map(str::to_string).ok_or_else(|| {
            Error::bootstrap_with_context(
                "endpoint",
                format!("cluster {} has no API server endpoint", cluster.name_any()),
            )
        })
    }

    async fn get_kubeconfig(&self, cluster: &Cluster) -> Result<String, Error> {
        let name = kubeconfig_secret_name(cluster);
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        debug!(cluster = %cluster.name_any(), secret = %name, "reading cluster kubeconfig");

        get_secret_data(&self.client, &name, &namespace, KUBECONFIG_SECRET_KEY)
            .await?
            .ok_or_else(|| {
                Error::bootstrap_with_context(
                    "kubeconfig",
                    format!("secret {}/{} has no kubeconfig", namespace, name),
                )
            })
    }
}
