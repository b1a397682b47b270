//! Security group and tag convergence for Update
//!
//! Both reconcilers compute a pure diff first and only call the cloud when
//! something actually changed. They report whether a change was made.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use keel_common::crd::AwsResourceReference;
use keel_common::Error;

use crate::config::ActuatorConfig;
use crate::instance::InstanceService;
use crate::scope::MachineScope;

/// Core groups plus every additional group referenced by id
pub fn desired_security_groups(
    core: Vec<String>,
    additional: &[AwsResourceReference],
) -> BTreeSet<String> {
    core.into_iter()
        .chain(additional.iter().filter_map(|r| r.id.clone()))
        .filter(|id| !id.is_empty())
        .collect()
}

/// Replace the instance's security groups if they differ from the desired set
pub async fn ensure_security_groups(
    instances: &dyn InstanceService,
    config: &ActuatorConfig,
    scope: &MachineScope,
    instance_id: &str,
    existing: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    let core = config
        .bounded(
            "get core security groups",
            instances.get_core_security_groups(scope),
        )
        .await?;
    let desired = desired_security_groups(core, &scope.machine_config().additional_security_groups);
    let current: BTreeSet<String> = existing.keys().cloned().collect();

    if desired == current {
        debug!(instance_id = %instance_id, "security groups up to date");
        return Ok(false);
    }

    info!(
        instance_id = %instance_id,
        desired = ?desired,
        current = ?current,
        "updating instance security groups"
    );
    config
        .bounded(
            "update security groups",
            instances.update_instance_security_groups(instance_id, desired.into_iter().collect()),
        )
        .await?;
    Ok(true)
}

/// Tag changes needed to move from the last applied set to the desired set
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TagDiff {
    /// Tags to create or overwrite
    pub create: BTreeMap<String, String>,
    /// Tags to delete
    pub remove: BTreeMap<String, String>,
}

impl TagDiff {
    /// Compare `desired` tags with what was applied last time
    pub fn between(
        desired: &BTreeMap<String, String>,
        last_applied: &BTreeMap<String, String>,
    ) -> Self {
        let create = desired
            .iter()
            .filter(|(k, v)| last_applied.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let remove = last_applied
            .iter()
            .filter(|(k, _)| !desired.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { create, remove }
    }

    /// True when no tag call is needed
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.remove.is_empty()
    }
}

/// Apply the machine's additional tags, tracking them in an annotation
///
/// Tags this code never applied are left alone; only keys recorded as last
/// applied can be removed.
pub async fn ensure_tags(
    instances: &dyn InstanceService,
    config: &ActuatorConfig,
    scope: &mut MachineScope,
    instance_id: &str,
) -> Result<bool, Error> {
    let annotation = config.last_applied_tags_annotation();
    let last_applied: BTreeMap<String, String> = match scope.annotation(&annotation) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
            Error::serialization_for_kind("Machine", format!("annotation {}: {}", annotation, e))
        })?,
        _ => BTreeMap::new(),
    };

    let desired = scope.machine_config().additional_tags.clone();
    let diff = TagDiff::between(&desired, &last_applied);
    if diff.is_empty() {
        debug!(instance_id = %instance_id, "tags up to date");
        return Ok(false);
    }

    info!(
        instance_id = %instance_id,
        create = diff.create.len(),
        remove = diff.remove.len(),
        "updating instance tags"
    );
    config
        .bounded(
            "update tags",
            instances.update_resource_tags(instance_id, diff.create, diff.remove),
        )
        .await?;

    let recorded = serde_json::to_string(&desired).map_err(|e| {
        Error::serialization_for_kind("Machine", format!("annotation {}: {}", annotation, e))
    })?;
    scope.set_annotation(annotation, recorded);
    Ok(true)
}
