use serde::{Deserialize, Serialize};

/// A named label attachable to instances.
///
/// kubeforge uses one tag per cluster, named `cluster=<id>`, as a secondary
/// membership index where the provider can filter by tag more cheaply than
/// by scanning display names. A tag with zero assignments is garbage and
/// gets deleted by the provisioner.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    /// Stable numeric identity assigned by the provider.
    pub tag_id: i64,
    /// The tag name.
    pub name: String,
}

/// An assignment binding a tag to an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagAssignment {
    /// The tag being assigned.
    pub tag_id: i64,
    /// The instance it is assigned to.
    pub instance_id: i64,
}
