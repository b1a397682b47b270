//! Cloud-side compute instance as reported by the instance service

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a cloud instance
///
/// Follows the EC2 instance lifecycle graph.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Launching
    Pending,
    /// Up and running
    Running,
    /// Terminate requested, not yet gone
    ShuttingDown,
    /// Gone
    Terminated,
    /// Stop requested
    Stopping,
    /// Stopped, can be restarted
    Stopped,
}

impl InstanceState {
    /// String form used by the cloud API
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// Only pending and running instances count as existing for reconciliation
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Termination is underway or done; another terminate call is pointless
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compute instance as described by the cloud provider
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Provider-assigned instance id (e.g. "i-0abc123")
    pub id: String,
    /// Instance type (e.g. "m5.large")
    #[serde(rename = "type")]
    pub instance_type: String,
    /// Current lifecycle state
    pub state: InstanceState,
    /// IAM instance profile name
    #[serde(default)]
    pub iam_profile: String,
    /// SSH key pair name, if one was attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    /// Root volume size in GiB
    #[serde(default)]
    pub root_device_size: i64,
    /// Subnet the instance was launched into
    #[serde(default)]
    pub subnet_id: String,
    /// Public IP address, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    /// Private IP address, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    /// Security group ids mapped to their names
    #[serde(default)]
    pub security_group_ids: BTreeMap<String, String>,
    /// Tags on the instance
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    /// Whether the instance carries a public IP address
    pub fn has_public_ip(&self) -> bool {
        self.public_ip.as_deref().is_some_and(|ip| !ip.is_empty())
    }
}
