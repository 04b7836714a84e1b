//! The trait the rest of kubeforge consumes the Instance Directory through.

use async_trait::async_trait;

use crate::errors::DirectoryError;
use crate::instance::{CreateInstanceRequest, Instance, ReinstallRequest};
use crate::network::PrivateNetwork;
use crate::secret::{CreateSecretRequest, Secret};
use crate::tag::{Tag, TagAssignment};

/// One page of a listing.
#[derive(Clone, Debug)]
pub struct Page<T> {
    /// The items on this page.
    pub items: Vec<T>,
    /// The page number that was requested (1-based).
    pub page: u32,
    /// The page size that was requested.
    pub size: u32,
}

impl<T> Page<T> {
    /// Whether this page ends the listing.
    ///
    /// The directory signals exhaustion with a short (or empty) page, so a
    /// full scan must keep requesting pages until this returns true.
    pub fn is_last(&self) -> bool {
        (self.items.len() as u32) < self.size
    }
}

/// CRUD and paginated listing for the cloud provider's resources.
///
/// Every method maps to a single provider call. None of them offer any
/// locking: concurrent writers racing on the same instance are resolved by
/// the caller through the display-name write-then-read-back protocol.
/// Transient provider failures ("resource is locked") are retried inside the
/// implementation with a bounded budget; everything else surfaces as a
/// [`DirectoryError`].
///
/// **Note**: this trait is defined using
/// [async-trait](https://crates.io/crates/async-trait), so the documentation
/// reflects the generated code. Implementations use `#[async_trait]` and
/// plain `async fn`s.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Lists one page of instances.
    async fn list_instances(&self, page: u32, size: u32) -> Result<Page<Instance>, DirectoryError>;

    /// Fetches a single instance.
    async fn get_instance(&self, instance_id: i64) -> Result<Instance, DirectoryError>;

    /// Creates a fresh instance. The provider allocates asynchronously;
    /// callers poll [`InstanceDirectory::get_instance`] until the status
    /// reaches the state they need.
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<Instance, DirectoryError>;

    /// Reinstalls an instance with a different image and set of SSH keys.
    /// Asynchronous at the provider, like creation.
    async fn reinstall_instance(
        &self,
        instance_id: i64,
        request: &ReinstallRequest,
    ) -> Result<(), DirectoryError>;

    /// Requests that a stopped instance be started.
    async fn start_instance(&self, instance_id: i64) -> Result<(), DirectoryError>;

    /// Requests that a running instance be stopped.
    async fn stop_instance(&self, instance_id: i64) -> Result<(), DirectoryError>;

    /// Overwrites an instance's display name.
    ///
    /// This is the only mutation the claim protocol needs. The directory
    /// applies it last-writer-wins; the caller must read the instance back
    /// to learn whether its write survived.
    async fn set_display_name(
        &self,
        instance_id: i64,
        display_name: &str,
    ) -> Result<(), DirectoryError>;

    /// Lists one page of secrets.
    async fn list_secrets(&self, page: u32, size: u32) -> Result<Page<Secret>, DirectoryError>;

    /// Creates a secret.
    async fn create_secret(&self, request: &CreateSecretRequest)
        -> Result<Secret, DirectoryError>;

    /// Deletes a secret.
    async fn delete_secret(&self, secret_id: i64) -> Result<(), DirectoryError>;

    /// Lists one page of private networks.
    async fn list_private_networks(
        &self,
        page: u32,
        size: u32,
    ) -> Result<Page<PrivateNetwork>, DirectoryError>;

    /// Creates a private network.
    async fn create_private_network(&self, name: &str)
        -> Result<PrivateNetwork, DirectoryError>;

    /// Deletes a private network. The network must have no attached
    /// instances.
    async fn delete_private_network(&self, network_id: i64) -> Result<(), DirectoryError>;

    /// Attaches an instance to a private network. Attaching an already
    /// attached instance is a no-op.
    async fn assign_private_network(
        &self,
        network_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError>;

    /// Detaches an instance from a private network. Detaching an instance
    /// that is not attached is a no-op.
    async fn unassign_private_network(
        &self,
        network_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError>;

    /// Lists one page of tags.
    async fn list_tags(&self, page: u32, size: u32) -> Result<Page<Tag>, DirectoryError>;

    /// Creates a tag.
    async fn create_tag(&self, name: &str) -> Result<Tag, DirectoryError>;

    /// Deletes a tag. A tag with zero assignments is garbage; the
    /// provisioner deletes it when the last member leaves.
    async fn delete_tag(&self, tag_id: i64) -> Result<(), DirectoryError>;

    /// Lists one page of a tag's assignments.
    async fn list_tag_assignments(
        &self,
        tag_id: i64,
        page: u32,
        size: u32,
    ) -> Result<Page<TagAssignment>, DirectoryError>;

    /// Assigns a tag to an instance. Assigning an already assigned tag is a
    /// no-op, not an error.
    async fn create_tag_assignment(
        &self,
        tag_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError>;

    /// Removes a tag assignment. Removing a missing assignment is a no-op.
    async fn delete_tag_assignment(
        &self,
        tag_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError>;
}
