//! The display-name ownership encoding.
//!
//! An instance's display name is the only mutable field the pool protocol
//! owns, so all membership metadata lives in it. The encoding and its
//! inverse are the single pair of functions below; no other code touches
//! the raw string. The format is a space-separated token list:
//!
//! ```text
//! ""                                                      unclaimed
//! "cluster=prod node=8f2a roles=control-plane+worker"     claimed
//! "cluster=prod node=8f2a roles=control-plane endpoint"   claimed, API endpoint
//! "error=ssh"                                             failed verification
//! ```
//!
//! Anything else was written by some other system and decodes as
//! [`Label::Foreign`], which the claim scan treats as not reusable.

use std::collections::BTreeSet;

use crate::node::NodeRole;

const ROLE_SEPARATOR: char = '+';

/// The decoded state of an instance display name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Label {
    /// Empty name: the instance is pooled and claimable.
    Unclaimed,
    /// The instance is bound to a cluster.
    Claimed(NodeLabel),
    /// The instance failed verification and was parked for an operator.
    Failed {
        /// The failure reason, typically the name of the failed check.
        reason: String,
    },
    /// A name this encoding does not understand. Never claimable.
    Foreign {
        /// The raw display name.
        raw: String,
    },
}

/// The ownership marker written at claim time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeLabel {
    /// The owning cluster.
    pub cluster_id: String,
    /// The node id generated for this claim.
    pub node_id: String,
    /// Roles the node was claimed for.
    pub roles: BTreeSet<NodeRole>,
    /// Whether this node is the cluster's API endpoint.
    pub endpoint: bool,
}

impl NodeLabel {
    /// A label binding `node_id` to `cluster_id` with the given roles.
    pub fn new(
        cluster_id: impl Into<String>,
        node_id: impl Into<String>,
        roles: BTreeSet<NodeRole>,
        endpoint: bool,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            node_id: node_id.into(),
            roles,
            endpoint,
        }
    }
}

impl Label {
    /// Renders the label into a display name.
    pub fn encode(&self) -> String {
        match self {
            Label::Unclaimed => String::new(),
            Label::Failed { reason } => format!("error={}", reason),
            Label::Foreign { raw } => raw.clone(),
            Label::Claimed(label) => {
                let mut out = format!("cluster={} node={}", label.cluster_id, label.node_id);
                if !label.roles.is_empty() {
                    let roles: Vec<String> =
                        label.roles.iter().map(ToString::to_string).collect();
                    out.push_str(" roles=");
                    out.push_str(&roles.join(&ROLE_SEPARATOR.to_string()));
                }
                if label.endpoint {
                    out.push_str(" endpoint");
                }
                out
            }
        }
    }

    /// Parses a display name. Never fails: names written by other systems
    /// come back as [`Label::Foreign`].
    pub fn decode(display_name: &str) -> Label {
        let trimmed = display_name.trim();
        if trimmed.is_empty() {
            return Label::Unclaimed;
        }
        if let Some(reason) = trimmed.strip_prefix("error=") {
            return Label::Failed {
                reason: reason.to_owned(),
            };
        }

        let mut cluster_id = None;
        let mut node_id = None;
        let mut roles = BTreeSet::new();
        let mut endpoint = false;
        for token in trimmed.split_whitespace() {
            match token.split_once('=') {
                Some(("cluster", value)) if !value.is_empty() => {
                    cluster_id = Some(value.to_owned())
                }
                Some(("node", value)) if !value.is_empty() => node_id = Some(value.to_owned()),
                Some(("roles", value)) => {
                    for role in value.split(ROLE_SEPARATOR) {
                        match role.parse() {
                            Ok(role) => {
                                roles.insert(role);
                            }
                            Err(_) => {
                                return Label::Foreign {
                                    raw: display_name.to_owned(),
                                }
                            }
                        }
                    }
                }
                None if token == "endpoint" => endpoint = true,
                _ => {
                    return Label::Foreign {
                        raw: display_name.to_owned(),
                    }
                }
            }
        }

        match (cluster_id, node_id) {
            (Some(cluster_id), Some(node_id)) => Label::Claimed(NodeLabel {
                cluster_id,
                node_id,
                roles,
                endpoint,
            }),
            _ => Label::Foreign {
                raw: display_name.to_owned(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roles(list: &[NodeRole]) -> BTreeSet<NodeRole> {
        list.iter().copied().collect()
    }

    #[test]
    fn empty_name_is_unclaimed() {
        assert_eq!(Label::decode(""), Label::Unclaimed);
        assert_eq!(Label::decode("   "), Label::Unclaimed);
        assert_eq!(Label::Unclaimed.encode(), "");
    }

    #[test]
    fn claimed_labels_round_trip() {
        let cases = vec![
            NodeLabel::new("prod", "8f2a", roles(&[]), false),
            NodeLabel::new("prod", "8f2a", roles(&[NodeRole::Worker]), false),
            NodeLabel::new(
                "a-1",
                "00ff",
                roles(&[NodeRole::ControlPlane, NodeRole::Worker]),
                true,
            ),
        ];
        for label in cases {
            let encoded = Label::Claimed(label.clone()).encode();
            assert_eq!(Label::decode(&encoded), Label::Claimed(label));
        }
    }

    #[test]
    fn endpoint_control_plane_encodes_as_documented() {
        let label = NodeLabel::new("prod", "8f2a", roles(&[NodeRole::ControlPlane]), true);
        assert_eq!(
            Label::Claimed(label).encode(),
            "cluster=prod node=8f2a roles=control-plane endpoint"
        );
    }

    #[test]
    fn failure_reasons_round_trip() {
        let label = Label::Failed {
            reason: "peer-public".to_owned(),
        };
        assert_eq!(Label::decode(&label.encode()), label);
    }

    #[test]
    fn unknown_names_are_foreign() {
        for raw in ["my pet server", "cluster=", "node=5", "roles=admiral cluster=a node=b"] {
            match Label::decode(raw) {
                Label::Foreign { .. } => {}
                other => panic!("expected foreign for {:?}, got {:?}", raw, other),
            }
        }
    }
}
