use serde::{Deserialize, Serialize};

/// A provider private network instances can be attached to.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateNetwork {
    /// Stable numeric identity assigned by the provider.
    pub network_id: i64,
    /// Human-chosen name. kubeforge names cluster networks `cluster=<id>`.
    pub name: String,
    /// CIDR of the network.
    #[serde(default)]
    pub cidr: Option<String>,
    /// Ids of the instances currently attached.
    #[serde(default)]
    pub instance_ids: Vec<i64>,
}
