//! AWS machine provider spec and status
//!
//! Optional fields are `Option` so that "not declared" and "declared as zero or
//! empty" stay distinguishable; the immutable-field check treats an undeclared
//! root volume size or subnet as "don't care".

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::InstanceState;

/// Filter used to look up a resource by attributes instead of id
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilter {
    /// Filter name (e.g. "tag:Name")
    pub name: String,
    /// Accepted values
    #[serde(default)]
    pub values: Vec<String>,
}

/// Reference to an AWS resource by id, ARN, or filters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsResourceReference {
    /// Resource id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Resource ARN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,

    /// Attribute filters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<ResourceFilter>,
}

impl AwsResourceReference {
    /// Reference a resource by id
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }
}

/// Desired configuration for a Machine's AWS instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsMachineProviderSpec {
    /// AMI to launch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami: Option<AwsResourceReference>,

    /// EC2 instance type (e.g. "m5.large")
    #[serde(default)]
    pub instance_type: String,

    /// Tags applied to the instance in addition to the provider's own
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_tags: BTreeMap<String, String>,

    /// IAM instance profile name
    #[serde(default)]
    pub iam_instance_profile: String,

    /// Whether the instance should get a public IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<bool>,

    /// Security groups attached in addition to the provider's core groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_security_groups: Vec<AwsResourceReference>,

    /// Subnet to launch into; unset lets the provider pick
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<AwsResourceReference>,

    /// SSH key pair name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    /// Root volume size in GiB; unset keeps the AMI default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_device_size: Option<i64>,
}

/// Provider-specific observed state recorded on the Machine status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsMachineProviderStatus {
    /// Id of the instance backing this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Last observed instance state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<InstanceState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_spec_leaves_optional_fields_unset() {
        let yaml = r#"
instanceType: m5.large
iamInstanceProfile: nodes.cluster-api-provider-aws.sigs.k8s.io
"#;
        let spec: AwsMachineProviderSpec =
            serde_yaml::from_str(yaml).expect("minimal spec should parse");
        assert_eq!(spec.instance_type, "m5.large");
        assert!(spec.key_name.is_none());
        assert!(spec.root_device_size.is_none());
        assert!(spec.subnet.is_none());
        assert!(spec.public_ip.is_none());
    }

    #[test]
    fn full_spec_with_references() {
        let yaml = r#"
instanceType: m5.xlarge
iamInstanceProfile: control-plane.cluster-api-provider-aws.sigs.k8s.io
keyName: default
rootDeviceSize: 100
publicIp: true
subnet:
  id: subnet-0a1b
additionalSecurityGroups:
  - id: sg-extra
additionalTags:
  team: platform
"#;
        let spec: AwsMachineProviderSpec =
            serde_yaml::from_str(yaml).expect("full spec should parse");
        assert_eq!(spec.root_device_size, Some(100));
        assert_eq!(spec.subnet, Some(AwsResourceReference::by_id("subnet-0a1b")));
        assert_eq!(spec.additional_security_groups.len(), 1);
        assert_eq!(spec.additional_tags.get("team").map(String::as_str), Some("platform"));
    }
}
