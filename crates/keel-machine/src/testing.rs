//! Fixtures shared by the unit tests

use std::collections::BTreeMap;

use kube::core::ObjectMeta;

use keel_common::crd::{
    AwsMachineProviderSpec, Cluster, ClusterReadiness, ClusterSpec, Instance, InstanceState,
    Machine, MachineSpec,
};
use keel_common::{LABEL_CLUSTER_NAME, LABEL_ROLE, ROLE_CONTROL_PLANE};

/// Cluster "prod" in "default" with infrastructure ready
pub fn cluster() -> Cluster {
    cluster_with(ClusterReadiness::INFRASTRUCTURE_READY)
}

/// Cluster "prod" at the given readiness
pub fn cluster_with(readiness: ClusterReadiness) -> Cluster {
    let mut cluster = cluster_named("prod");
    cluster.metadata.annotations = Some(readiness.to_annotations());
    cluster
}

/// Un-annotated cluster with the given name in "default"
pub fn cluster_named(name: &str) -> Cluster {
    let mut cluster = Cluster::new(name, ClusterSpec::default());
    cluster.metadata.namespace = Some("default".to_string());
    cluster
}

fn machine(name: &str, role: Option<&str>) -> Machine {
    let mut labels = BTreeMap::from([(LABEL_CLUSTER_NAME.to_string(), "prod".to_string())]);
    if let Some(role) = role {
        labels.insert(LABEL_ROLE.to_string(), role.to_string());
    }

    let mut machine = Machine::new(
        name,
        MachineSpec {
            provider_spec: AwsMachineProviderSpec {
                instance_type: "m5.large".to_string(),
                iam_instance_profile: "nodes".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    machine.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        labels: Some(labels),
        ..Default::default()
    };
    machine
}

/// Control plane machine of cluster "prod"
pub fn control_plane_machine(name: &str) -> Machine {
    machine(name, Some(ROLE_CONTROL_PLANE))
}

/// Worker machine of cluster "prod"
pub fn worker_machine(name: &str) -> Machine {
    machine(name, None)
}

/// Instance matching the fixture machines' provider spec
pub fn instance(id: &str, state: InstanceState) -> Instance {
    Instance {
        id: id.to_string(),
        instance_type: "m5.large".to_string(),
        state,
        iam_profile: "nodes".to_string(),
        key_name: None,
        root_device_size: 8,
        subnet_id: "subnet-1".to_string(),
        public_ip: None,
        private_ip: Some("10.0.0.10".to_string()),
        security_group_ids: BTreeMap::new(),
        tags: BTreeMap::new(),
    }
}
