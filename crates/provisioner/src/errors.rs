use cloud_api::{DirectoryError, InstanceStatus};

use crate::verify::VerificationError;

/// Errors produced by the node provisioner.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// No unclaimed instance matched the request and auto-provisioning is
    /// disabled. Fatal: never retried.
    #[error("no unclaimed instance available and auto-provisioning is disabled")]
    NoCapacity,

    /// The node is not a member of the cluster.
    #[error("node {node_id} not found in cluster {cluster_id}")]
    NodeNotFound {
        /// The cluster that was searched.
        cluster_id: String,
        /// The id that failed to resolve.
        node_id: String,
    },

    /// A verification check failed on the current candidate.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Every provisioning attempt ended in a verification failure.
    #[error("gave up after {attempts} provisioning attempts: {source}")]
    AttemptsExhausted {
        /// How many candidates were claimed and released.
        attempts: u32,
        /// The failure that ended the final attempt.
        #[source]
        source: Box<VerificationError>,
    },

    /// An instance never converged to the status an operation required.
    #[error("instance {instance_id} never reached {expected:?}: {detail}")]
    StatusTimeout {
        /// The instance being waited on.
        instance_id: i64,
        /// The status that was required.
        expected: InstanceStatus,
        /// Description of the timeout, including the last observed error.
        detail: String,
    },

    /// A claimed instance carries no public address to verify or SSH into.
    #[error("instance {0} has no public IPv4 address")]
    MissingAddress(i64),

    /// The Instance Directory failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
