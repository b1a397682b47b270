//! Immutable-field validation for Update
//!
//! Fields below are fixed at instance creation. An Update whose spec differs
//! from the live instance on any of them is rejected as a whole.

use keel_common::crd::{AwsMachineProviderSpec, Instance};

/// Every immutable field where `spec` and `instance` disagree
///
/// Undeclared root volume size and subnet are not compared. A subnet declared
/// without an id, an unset key name, and an unset public IP flag compare as
/// empty or false.
pub fn is_machine_outdated(spec: &AwsMachineProviderSpec, instance: &Instance) -> Vec<String> {
    let mut violations = Vec::new();

    if spec.instance_type != instance.instance_type {
        violations.push(format!(
            "instance type cannot be mutated from {:?} to {:?}",
            instance.instance_type, spec.instance_type
        ));
    }

    if spec.iam_instance_profile != instance.iam_profile {
        violations.push(format!(
            "instance IAM profile cannot be mutated from {:?} to {:?}",
            instance.iam_profile, spec.iam_instance_profile
        ));
    }

    let desired_key = spec.key_name.as_deref().unwrap_or_default();
    let current_key = instance.key_name.as_deref().unwrap_or_default();
    if desired_key != current_key {
        violations.push(format!(
            "SSH key name cannot be mutated from {:?} to {:?}",
            current_key, desired_key
        ));
    }

    if let Some(size) = spec.root_device_size.filter(|s| *s > 0) {
        if size != instance.root_device_size {
            violations.push(format!(
                "root volume size cannot be mutated from {} to {}",
                instance.root_device_size, size
            ));
        }
    }

    if let Some(subnet) = spec.subnet.as_ref() {
        let subnet_id = subnet.id.as_deref().unwrap_or_default();
        if subnet_id != instance.subnet_id {
            violations.push(format!(
                "machine subnet ID cannot be mutated from {:?} to {:?}",
                instance.subnet_id, subnet_id
            ));
        }
    }

    let desired_public_ip = spec.public_ip.unwrap_or(false);
    let has_public_ip = instance.has_public_ip();
    if desired_public_ip != has_public_ip {
        violations.push(format!(
            "public IP setting cannot be mutated from \"{}\" to \"{}\"",
            has_public_ip, desired_public_ip
        ));
    }

    violations
}
