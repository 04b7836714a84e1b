use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use cloud_api::Instance;

use crate::label::Label;

/// The role a node plays in its cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeRole {
    /// Runs the control plane (API server, etcd, scheduler).
    ControlPlane,
    /// Runs workloads only.
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::ControlPlane => write!(f, "control-plane"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control-plane" => Ok(NodeRole::ControlPlane),
            "worker" => Ok(NodeRole::Worker),
            other => Err(format!("unknown node role: {}", other)),
        }
    }
}

/// The stable handle the administrator operates on.
///
/// A `Node` is never stored anywhere: it is reconstructed from the
/// underlying [`Instance`] on every read, with the cluster binding, roles
/// and endpoint marker decoded from the instance display name.
#[derive(Clone, Debug)]
pub struct Node {
    /// The cluster this node belongs to.
    pub cluster_id: String,
    /// The node id generated at claim time.
    pub id: String,
    /// The Kubernetes node name, derived from the id.
    pub name: String,
    /// Public address, used for SSH and peer reachability.
    pub public_ip: IpAddr,
    /// Private address, present when private networking is attached.
    pub private_ip: Option<IpAddr>,
    /// Roles requested for this node.
    pub roles: BTreeSet<NodeRole>,
    /// Whether this node is the cluster's API endpoint (the first control
    /// plane ever bootstrapped). Removing it breaks cluster reachability,
    /// so the administrator refuses to while other nodes remain.
    pub endpoint: bool,
    /// The underlying instance.
    pub instance_id: i64,
}

impl Node {
    /// Reconstructs a node from an instance, if the instance is claimed by
    /// `cluster_id` and has a public address.
    pub fn from_instance(cluster_id: &str, instance: &Instance) -> Option<Node> {
        let label = match Label::decode(&instance.display_name) {
            Label::Claimed(label) if label.cluster_id == cluster_id => label,
            _ => return None,
        };
        let public_ip = instance.ipv4?;
        Some(Node {
            cluster_id: label.cluster_id,
            name: format!("node-{}", label.node_id),
            id: label.node_id,
            public_ip,
            private_ip: instance.private_ipv4,
            roles: label.roles,
            endpoint: label.endpoint,
            instance_id: instance.instance_id,
        })
    }

    /// Whether this node carries the control-plane role.
    pub fn is_control_plane(&self) -> bool {
        self.roles.contains(&NodeRole::ControlPlane)
    }
}
