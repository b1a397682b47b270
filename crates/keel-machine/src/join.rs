//! Control plane init/join decision
//!
//! Re-evaluated on every Create: the cluster's readiness and the machine's
//! role are read fresh each time and nothing is cached between calls.

use tracing::debug;

use keel_common::crd::{Cluster, Machine};
use keel_common::Error;

use crate::config::ActuatorConfig;
use crate::locker::ControlPlaneInitLocker;

/// How a machine enters its cluster's control plane
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeBootstrap {
    /// Bootstrap a new control plane; no token is needed
    Init,
    /// Enroll into the existing control plane with a bootstrap token
    Join,
}

/// Machines of a cluster that are live control plane members
pub fn control_plane_machines(machines: &[Machine]) -> Vec<&Machine> {
    machines
        .iter()
        .filter(|m| !m.is_being_deleted() && m.role().is_control_plane())
        .collect()
}

/// Decide whether `machine` initialises or joins `cluster`'s control plane
///
/// Returns a requeue error when the machine has to join but nothing exists
/// to join yet. Only one caller per cluster ever gets [`NodeBootstrap::Init`].
pub async fn determine_join(
    locker: &dyn ControlPlaneInitLocker,
    cluster: &Cluster,
    machine: &Machine,
    config: &ActuatorConfig,
) -> Result<NodeBootstrap, Error> {
    if cluster.readiness().is_control_plane_ready() {
        return Ok(NodeBootstrap::Join);
    }

    if !machine.role().is_control_plane() {
        debug!(machine = %machine.qualified_name(), "worker waiting for control plane");
        return Err(Error::requeue_after(
            config.control_plane_machine_wait,
            "control plane is not ready yet",
        ));
    }

    if locker.acquire(cluster).await {
        debug!(machine = %machine.qualified_name(), "machine initialises the control plane");
        return Ok(NodeBootstrap::Init);
    }

    debug!(machine = %machine.qualified_name(), "control plane init lock held elsewhere");
    Err(Error::requeue_after(
        config.control_plane_ready_wait,
        "another machine is initialising the control plane",
    ))
}
