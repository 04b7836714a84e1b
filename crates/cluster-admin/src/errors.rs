use provisioner::ProvisionError;

/// Errors produced by the cluster administrator.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// The requested Kubernetes version has no strategy.
    #[error("unsupported Kubernetes version {version} (supported: {supported})")]
    UnsupportedVersion {
        /// The version tag that failed to resolve.
        version: String,
        /// The versions a strategy exists for.
        supported: String,
    },

    /// The cluster has no control-plane node to coordinate through.
    #[error("cluster {0} has no control-plane node")]
    NoControlPlane(String),

    /// Removing this node would leave the cluster without a control plane.
    #[error("cannot remove the only control-plane node {0}")]
    LastControlPlane(String),

    /// The node is the cluster's API endpoint and other nodes still depend
    /// on it for reachability.
    #[error(
        "node {0} is the cluster API endpoint; remove the other nodes first or delete the cluster"
    )]
    EndpointNode(String),

    /// No control-plane node answered SSH.
    #[error("no reachable control-plane node in cluster {0}")]
    NoReachableControlPlane(String),

    /// The join coordinator did not produce a join command.
    #[error("coordinator node {0} returned an empty join command")]
    EmptyJoinCommand(String),

    /// The post-snapshot integrity check failed; the snapshot must not be
    /// trusted.
    #[error("etcd backup at {path} failed verification: {reason}")]
    BackupVerificationFailed {
        /// Where the snapshot was written.
        path: String,
        /// Why verification rejected it.
        reason: String,
    },

    /// Etcd did not report full health where full health was required.
    #[error("etcd reports {healthy} of {total} endpoints healthy")]
    EtcdUnhealthy {
        /// Endpoints reporting healthy.
        healthy: usize,
        /// Endpoints probed.
        total: usize,
    },

    /// A remote command failed.
    #[error("{context} failed on node {node_id}")]
    Remote {
        /// What the command was doing.
        context: String,
        /// The node it ran on.
        node_id: String,
        /// The underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// The bootstrap configuration could not be rendered.
    #[error("failed to render bootstrap configuration")]
    Render(#[from] serde_yaml::Error),

    /// Node provisioning failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}
