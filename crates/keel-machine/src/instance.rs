//! Cloud instance service seam
//!
//! The cloud API client lives outside this crate; the actuator only depends
//! on this trait. Implementations must make `create_or_get_instance`
//! idempotent for a given scope: repeated calls return the same instance.

use std::collections::BTreeMap;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use keel_common::crd::Instance;
use keel_common::Error;

use crate::scope::MachineScope;

/// Instance lifecycle operations against the cloud provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceService: Send + Sync {
    /// Return the machine's instance, creating it if it does not exist yet
    ///
    /// `bootstrap_token` is empty when the machine initialises the control plane.
    async fn create_or_get_instance(
        &self,
        scope: &MachineScope,
        bootstrap_token: &str,
    ) -> Result<Instance, Error>;

    /// Describe an instance by id, `None` if it does not exist
    async fn instance_if_exists(&self, instance_id: &str) -> Result<Option<Instance>, Error>;

    /// Find the machine's instance through its identifying tags
    async fn instance_by_tags(&self, scope: &MachineScope) -> Result<Option<Instance>, Error>;

    /// Request termination of an instance
    async fn terminate_instance(&self, instance_id: &str) -> Result<(), Error>;

    /// Security groups currently attached to an instance, id to name
    async fn get_instance_security_groups(
        &self,
        instance_id: &str,
    ) -> Result<BTreeMap<String, String>, Error>;

    /// Security groups the provider always attaches for this machine's role
    async fn get_core_security_groups(&self, scope: &MachineScope) -> Result<Vec<String>, Error>;

    /// Replace the instance's security groups with exactly `group_ids`
    async fn update_instance_security_groups(
        &self,
        instance_id: &str,
        group_ids: Vec<String>,
    ) -> Result<(), Error>;

    /// Create or overwrite `create` tags and delete `remove` tags on a resource
    async fn update_resource_tags(
        &self,
        resource_id: &str,
        create: BTreeMap<String, String>,
        remove: BTreeMap<String, String>,
    ) -> Result<(), Error>;
}
