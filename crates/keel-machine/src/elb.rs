//! API server load balancer attachment

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use keel_common::crd::Instance;
use keel_common::Error;

use crate::scope::MachineScope;

/// Load balancer operations against the cloud provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerService: Send + Sync {
    /// Register an instance with the cluster's API server load balancer
    ///
    /// Registering an already registered instance must succeed.
    async fn register_instance_with_api_server_lb(
        &self,
        scope: &MachineScope,
        instance_id: &str,
    ) -> Result<(), Error>;
}

/// Attach control plane instances to the API server load balancer
///
/// Worker machines are skipped.
pub async fn reconcile_lb_attachment(
    load_balancers: &dyn LoadBalancerService,
    scope: &MachineScope,
    instance: &Instance,
) -> Result<(), Error> {
    if !scope.role().is_control_plane() {
        debug!(machine = %scope.name(), "worker machine, skipping load balancer attachment");
        return Ok(());
    }

    load_balancers
        .register_instance_with_api_server_lb(scope, &instance.id)
        .await
        .map_err(|e| {
            e.context(format!(
                "could not register control plane instance {:?} with load balancer",
                instance.id
            ))
        })
}
