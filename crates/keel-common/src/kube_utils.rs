//! Shared Kubernetes utilities using kube-rs

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Default connection timeout for workload cluster clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for workload cluster clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// True if the error is a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True if the error is a 409 (already exists / resourceVersion conflict)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Build a client from in-memory kubeconfig YAML, pointed at `server_url`
///
/// The server in the kubeconfig is replaced so that callers can reach the
/// control plane through an address they resolved themselves (e.g. the API
/// server load balancer) while keeping the kubeconfig's credentials.
pub async fn client_from_kubeconfig(
    kubeconfig_yaml: &str,
    server_url: &str,
) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml).map_err(|e| {
        Error::bootstrap_with_context("kubeconfig", format!("failed to parse kubeconfig: {}", e))
    })?;

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::bootstrap_with_context("kubeconfig", format!("failed to load kubeconfig: {}", e))
        })?;

    config.cluster_url = server_url.parse().map_err(|e| {
        Error::bootstrap_with_context(
            "kubeconfig",
            format!("invalid server url {:?}: {}", server_url, e),
        )
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    debug!(server = %server_url, "building client for workload cluster");
    Client::try_from(config).map_err(|e| {
        Error::bootstrap_with_context(
            "kubeconfig",
            format!("failed to get client config for cluster at {}: {}", server_url, e),
        )
    })
}

/// Read one key of a Secret as UTF-8, `None` if the secret or key is absent
pub async fn get_secret_data(
    client: &Client,
    name: &str,
    namespace: &str,
    key: &str,
) -> Result<Option<String>, Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = match api.get(name).await {
        Ok(secret) => secret,
        Err(e) if is_not_found(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) else {
        return Ok(None);
    };

    String::from_utf8(bytes.0.clone())
        .map(Some)
        .map_err(|e| Error::serialization_for_kind("Secret", format!("{}/{}: {}", name, key, e)))
}
