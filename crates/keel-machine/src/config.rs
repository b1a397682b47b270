//! Actuator configuration
//!
//! Defaults match the delays the rest of the orchestration system expects.
//! Each value can be overridden through a `KEEL_*` environment variable.

use std::future::Future;
use std::time::Duration;

use keel_common::Error;

/// Default lifetime of a join token
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);
/// Delay before retrying Create when cluster infrastructure is not ready
pub const WAIT_FOR_INFRASTRUCTURE_READY: Duration = Duration::from_secs(15);
/// Delay before retrying when no control plane machine exists yet
pub const WAIT_FOR_CONTROL_PLANE_MACHINE: Duration = Duration::from_secs(5);
/// Delay before retrying after losing the control plane init race
pub const WAIT_FOR_CONTROL_PLANE_READY: Duration = Duration::from_secs(5);
/// Default upper bound for a single collaborator call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Port the API server load balancer listens on
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// Tunables for the machine actuator
#[derive(Clone, Debug, PartialEq)]
pub struct ActuatorConfig {
    /// Provider name used in provider ids and the managed-by annotation
    pub provider: String,
    /// Lifetime of bootstrap tokens issued for joining machines
    pub token_ttl: Duration,
    /// Requeue delay while cluster infrastructure is provisioning
    pub infrastructure_ready_wait: Duration,
    /// Requeue delay while no control plane machine exists
    pub control_plane_machine_wait: Duration,
    /// Requeue delay after losing the init race
    pub control_plane_ready_wait: Duration,
    /// API server port on the control plane endpoint
    pub api_server_port: u16,
    /// Upper bound for each collaborator call
    pub call_timeout: Duration,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            provider: "aws".to_string(),
            token_ttl: DEFAULT_TOKEN_TTL,
            infrastructure_ready_wait: WAIT_FOR_INFRASTRUCTURE_READY,
            control_plane_machine_wait: WAIT_FOR_CONTROL_PLANE_MACHINE,
            control_plane_ready_wait: WAIT_FOR_CONTROL_PLANE_READY,
            api_server_port: DEFAULT_API_SERVER_PORT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl ActuatorConfig {
    /// Defaults overridden by `KEEL_*` environment variables
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(provider) = lookup("KEEL_PROVIDER") {
            if provider.is_empty() {
                return Err(Error::validation_for_field(
                    "config",
                    "KEEL_PROVIDER",
                    "provider name cannot be empty",
                ));
            }
            config.provider = provider;
        }

        let secs = |key: &str, current: Duration| -> Result<Duration, Error> {
            match lookup(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| Error::validation_for_field("config", key, e.to_string())),
                None => Ok(current),
            }
        };

        config.token_ttl = secs("KEEL_TOKEN_TTL_SECS", config.token_ttl)?;
        config.infrastructure_ready_wait =
            secs("KEEL_INFRASTRUCTURE_WAIT_SECS", config.infrastructure_ready_wait)?;
        config.control_plane_machine_wait =
            secs("KEEL_CONTROL_PLANE_MACHINE_WAIT_SECS", config.control_plane_machine_wait)?;
        config.control_plane_ready_wait =
            secs("KEEL_CONTROL_PLANE_READY_WAIT_SECS", config.control_plane_ready_wait)?;
        config.call_timeout = secs("KEEL_CALL_TIMEOUT_SECS", config.call_timeout)?;

        if let Some(raw) = lookup("KEEL_API_SERVER_PORT") {
            config.api_server_port = raw.parse::<u16>().map_err(|e| {
                Error::validation_for_field("config", "KEEL_API_SERVER_PORT", e.to_string())
            })?;
        }

        Ok(config)
    }

    /// Run one collaborator call under [`Self::call_timeout`]
    pub async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| Error::timeout(operation, self.call_timeout))?
    }

    /// Annotation marking a machine as managed by this provider
    pub fn managed_annotation(&self) -> String {
        format!("cluster-api-provider-{}", self.provider)
    }

    /// Annotation recording the last tag set applied to the instance
    pub fn last_applied_tags_annotation(&self) -> String {
        format!("cluster-api-provider-{}-last-applied-tags", self.provider)
    }
}
