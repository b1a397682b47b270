//! Bootstrap token issuance for joining machines
//!
//! Tokens use the kubeadm format `<id>.<secret>` and are stored on the
//! workload cluster as `bootstrap.kubernetes.io/token` secrets, where the
//! API server's bootstrap authenticator picks them up.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use rand::Rng;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use keel_common::kube_utils::client_from_kubeconfig;
use keel_common::{Error, KUBE_SYSTEM_NAMESPACE};

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;

/// Secret type recognised by the bootstrap token authenticator
pub const BOOTSTRAP_TOKEN_SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";
/// Group joining nodes authenticate as
pub const DEFAULT_NODE_TOKEN_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";

/// Where and how to reach an existing control plane
#[derive(Clone, PartialEq)]
pub struct ControlPlaneEndpoint {
    /// API server URL, e.g. `https://10.0.0.1:6443`
    pub url: String,
    /// Admin kubeconfig YAML; its server is replaced by `url`
    pub kubeconfig: String,
}

impl std::fmt::Debug for ControlPlaneEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // kubeconfig carries credentials
        f.debug_struct("ControlPlaneEndpoint")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Issues short-lived credentials for machines joining a control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Create a bootstrap token valid for `ttl` on the given control plane
    async fn new_bootstrap_token(
        &self,
        endpoint: &ControlPlaneEndpoint,
        ttl: Duration,
    ) -> Result<String, Error>;
}

/// A kubeadm bootstrap token
#[derive(Clone)]
pub struct BootstrapToken {
    id: String,
    secret: String,
}

impl BootstrapToken {
    /// Generate a new random token
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut random = |len: usize| -> String {
            (0..len)
                .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
                .collect()
        };
        let id = random(TOKEN_ID_LEN);
        let secret = random(TOKEN_SECRET_LEN);
        Self { id, secret }
    }

    /// Parse a token in `<id>.<secret>` form
    pub fn from_string(s: &str) -> Result<Self, Error> {
        let invalid = || Error::bootstrap_with_context("token", "invalid bootstrap token format");
        let (id, secret) = s.split_once('.').ok_or_else(invalid)?;
        let valid = |part: &str, len: usize| {
            part.len() == len && part.bytes().all(|b| TOKEN_CHARSET.contains(&b))
        };
        if !valid(id, TOKEN_ID_LEN) || !valid(secret, TOKEN_SECRET_LEN) {
            return Err(invalid());
        }
        Ok(Self {
            id: id.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Public token id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the secret storing this token
    pub fn secret_name(&self) -> String {
        format!("bootstrap-token-{}", self.id)
    }

    /// Build the kube-system secret that makes this token valid until `now + ttl`
    pub fn to_secret(&self, now: DateTime<Utc>, ttl: Duration) -> Result<Secret, Error> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| {
            Error::bootstrap_with_context("token", format!("invalid token ttl: {}", e))
        })?;
        let expiration = (now + ttl).to_rfc3339_opts(SecondsFormat::Secs, true);

        let string_data = BTreeMap::from([
            ("token-id".to_string(), self.id.clone()),
            ("token-secret".to_string(), self.secret.clone()),
            ("expiration".to_string(), expiration),
            ("usage-bootstrap-authentication".to_string(), "true".to_string()),
            ("usage-bootstrap-signing".to_string(), "true".to_string()),
            (
                "auth-extra-groups".to_string(),
                DEFAULT_NODE_TOKEN_GROUP.to_string(),
            ),
        ]);

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name()),
                namespace: Some(KUBE_SYSTEM_NAMESPACE.to_string()),
                ..Default::default()
            },
            type_: Some(BOOTSTRAP_TOKEN_SECRET_TYPE.to_string()),
            string_data: Some(string_data),
            ..Default::default()
        })
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the secret half in debug output
        f.debug_struct("BootstrapToken")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.id, self.secret)
    }
}

/// [`TokenIssuer`] writing bootstrap token secrets on the workload cluster
#[derive(Debug, Default)]
pub struct KubeTokenIssuer;

impl KubeTokenIssuer {
    /// Create a new issuer
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TokenIssuer for KubeTokenIssuer {
    async fn new_bootstrap_token(
        &self,
        endpoint: &ControlPlaneEndpoint,
        ttl: Duration,
    ) -> Result<String, Error> {
        let client = client_from_kubeconfig(&endpoint.kubeconfig, &endpoint.url).await?;
        let token = BootstrapToken::generate();
        let secret = token.to_secret(Utc::now(), ttl)?;

        let api: Api<Secret> = Api::namespaced(client, KUBE_SYSTEM_NAMESPACE);
        api.create(&PostParams::default(), &secret)
            .await
            .map_err(|e| {
                Error::bootstrap_with_context(
                    "token",
                    format!("failed to create bootstrap token secret: {}", e),
                )
            })?;

        info!(server = %endpoint.url, token_id = %token.id(), ttl = ?ttl, "issued bootstrap token");
        Ok(token.to_string())
    }
}
