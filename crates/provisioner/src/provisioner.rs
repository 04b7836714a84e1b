//! The claim/verify/release protocol over the instance pool.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use cloud_api::{
    CreateInstanceRequest, CreateSecretRequest, DirectoryError, Instance, InstanceDirectory,
    InstanceStatus, PrivateNetwork, ReinstallRequest, SecretType, Tag,
};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::claim::{claim_instance, ClaimOutcome};
use crate::config::Config;
use crate::errors::ProvisionError;
use crate::label::{Label, NodeLabel};
use crate::node::{Node, NodeRole};
use crate::poll::poll_until;
use crate::ssh::CommandRunner;
use crate::verify::verify_node;

const NODE_ID_LEN: usize = 12;

/// What to provision a node for.
#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    /// The cluster the node will belong to.
    pub cluster_id: String,
    /// Region override for auto-provisioned instances. Defaults to the
    /// configured region.
    pub region: Option<String>,
    /// The SSH public key that must be injected into the node.
    pub ssh_public_key: String,
    /// Roles recorded in the node's ownership label.
    pub roles: BTreeSet<NodeRole>,
    /// Whether this node becomes the cluster's API endpoint. Only the
    /// bootstrap control plane sets this.
    pub endpoint: bool,
    /// Peers the new node must be able to reach. `None` means every node
    /// currently in the cluster.
    pub peer_node_ids: Option<Vec<String>>,
}

impl ProvisionRequest {
    /// A request for a node with the given roles.
    pub fn new(
        cluster_id: impl Into<String>,
        ssh_public_key: impl Into<String>,
        roles: BTreeSet<NodeRole>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            region: None,
            ssh_public_key: ssh_public_key.into(),
            roles,
            endpoint: false,
            peer_node_ids: None,
        }
    }
}

/// The seam the cluster administrator consumes node provisioning through.
///
/// **Note**: defined with [async-trait](https://crates.io/crates/async-trait).
#[async_trait]
pub trait Provision: Send + Sync {
    /// Produces a verified node bound to the requested cluster, or fails
    /// loudly. Never returns a half-verified node.
    async fn provision_node(&self, request: ProvisionRequest) -> Result<Node, ProvisionError>;

    /// Returns a node's instance to the pool. Safe to call on a node that
    /// is already gone; cleanup paths call this speculatively.
    async fn deprovision_node(&self, cluster_id: &str, node_id: &str)
        -> Result<(), ProvisionError>;

    /// All nodes of a cluster as a lazy, restartable sequence. The stream
    /// pages through the directory on demand and terminates when a short
    /// page is returned; callers needing a snapshot must drain it.
    fn list_nodes(&self, cluster_id: &str) -> BoxStream<'static, Result<Node, ProvisionError>>;

    /// Point lookup of one node.
    async fn get_node(&self, cluster_id: &str, node_id: &str) -> Result<Node, ProvisionError>;
}

/// The production [`Provision`] implementation.
pub struct NodeProvisioner<D> {
    directory: Arc<D>,
    runner: Arc<dyn CommandRunner>,
    config: Config,
}

impl<D: InstanceDirectory + 'static> NodeProvisioner<D> {
    /// A provisioner over the given directory and command runner.
    pub fn new(directory: Arc<D>, runner: Arc<dyn CommandRunner>, config: Config) -> Self {
        Self {
            directory,
            runner,
            config,
        }
    }

    fn generate_node_id() -> String {
        let mut id = Uuid::new_v4().to_simple().to_string();
        id.truncate(NODE_ID_LEN);
        id
    }

    fn cluster_tag_name(cluster_id: &str) -> String {
        format!("cluster={}", cluster_id)
    }

    /// Finds or creates the secret holding the requested public key and
    /// returns its id.
    async fn ensure_ssh_secret(&self, public_key: &str) -> Result<i64, DirectoryError> {
        let wanted = public_key.trim();
        let mut page = 1;
        loop {
            let batch = self
                .directory
                .list_secrets(page, self.config.page_size)
                .await?;
            for secret in &batch.items {
                if secret.secret_type == SecretType::Ssh && secret.value.trim() == wanted {
                    return Ok(secret.secret_id);
                }
            }
            if batch.is_last() {
                break;
            }
            page += 1;
        }
        let secret = self
            .directory
            .create_secret(&CreateSecretRequest {
                name: format!("kubeforge-{}", Self::generate_node_id()),
                secret_type: SecretType::Ssh,
                value: wanted.to_owned(),
            })
            .await?;
        Ok(secret.secret_id)
    }

    fn is_candidate(&self, instance: &Instance) -> bool {
        Label::decode(&instance.display_name) == Label::Unclaimed
            && instance.product_id == self.config.product_id
            && instance.is_intact()
            && matches!(
                instance.status,
                InstanceStatus::Running | InstanceStatus::Stopped
            )
    }

    /// Scans the pool for an unclaimed candidate and claims it, falling
    /// back to creating a fresh instance when permitted.
    async fn claim_candidate(
        &self,
        request: &ProvisionRequest,
        label: &NodeLabel,
    ) -> Result<Instance, ProvisionError> {
        let mut page = 1;
        loop {
            let batch = self
                .directory
                .list_instances(page, self.config.page_size)
                .await?;
            let last = batch.is_last();
            for instance in &batch.items {
                if !self.is_candidate(instance) {
                    continue;
                }
                match claim_instance(self.directory.as_ref(), instance.instance_id, label).await?
                {
                    ClaimOutcome::Won => {
                        info!(
                            instance_id = instance.instance_id,
                            node_id = %label.node_id,
                            "claimed pooled instance"
                        );
                        return Ok(self.directory.get_instance(instance.instance_id).await?);
                    }
                    ClaimOutcome::Lost => {
                        debug!(
                            instance_id = instance.instance_id,
                            "lost claim race, trying the next candidate"
                        );
                    }
                }
            }
            if last {
                break;
            }
            page += 1;
        }

        if !self.config.auto_provision {
            return Err(ProvisionError::NoCapacity);
        }

        // Creating with the ownership label preset means the instance never
        // appears unclaimed to other scanners.
        let region = request
            .region
            .clone()
            .unwrap_or_else(|| self.config.region.clone());
        info!(cluster_id = %label.cluster_id, %region, "pool exhausted, creating a fresh instance");
        let instance = self
            .directory
            .create_instance(&CreateInstanceRequest {
                product_id: self.config.product_id.clone(),
                image_id: self.config.image_id.clone(),
                region,
                ssh_keys: Vec::new(),
                display_name: Label::Claimed(label.clone()).encode(),
                add_ons: Vec::new(),
            })
            .await?;
        Ok(instance)
    }

    async fn wait_for_status(
        &self,
        instance_id: i64,
        expected: InstanceStatus,
    ) -> Result<Instance, ProvisionError> {
        let directory = &self.directory;
        poll_until(
            &format!("instance {} to reach {:?}", instance_id, expected),
            &self.config.status_poll,
            || async move {
                let instance = directory.get_instance(instance_id).await?;
                Ok::<_, DirectoryError>(if instance.status == expected {
                    Some(instance)
                } else {
                    None
                })
            },
        )
        .await
        .map_err(|e| ProvisionError::StatusTimeout {
            instance_id,
            expected,
            detail: e.to_string(),
        })
    }

    /// Brings the instance to the required image, keys and power state.
    /// Reinstalls are asynchronous at the provider, so this polls until the
    /// instance reports running again.
    async fn ensure_installed(
        &self,
        instance: Instance,
        secret_id: i64,
    ) -> Result<Instance, ProvisionError> {
        let needs_reinstall = instance.image_id != self.config.image_id
            || !instance.ssh_keys.contains(&secret_id);
        if needs_reinstall {
            info!(
                instance_id = instance.instance_id,
                image = %self.config.image_id,
                "reinstalling instance with required image and keys"
            );
            self.directory
                .reinstall_instance(
                    instance.instance_id,
                    &ReinstallRequest {
                        image_id: self.config.image_id.clone(),
                        ssh_keys: vec![secret_id],
                    },
                )
                .await?;
        } else if instance.status == InstanceStatus::Stopped {
            self.directory.start_instance(instance.instance_id).await?;
        }
        self.wait_for_status(instance.instance_id, InstanceStatus::Running)
            .await
    }

    async fn find_tag(&self, name: &str) -> Result<Option<Tag>, DirectoryError> {
        let mut page = 1;
        loop {
            let batch = self.directory.list_tags(page, self.config.page_size).await?;
            if let Some(tag) = batch.items.iter().find(|t| t.name == name) {
                return Ok(Some(tag.clone()));
            }
            if batch.is_last() {
                return Ok(None);
            }
            page += 1;
        }
    }

    async fn register_membership(
        &self,
        cluster_id: &str,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        if !self.config.use_tags {
            return Ok(());
        }
        let name = Self::cluster_tag_name(cluster_id);
        let tag = match self.find_tag(&name).await? {
            Some(tag) => tag,
            None => self.directory.create_tag(&name).await?,
        };
        self.directory
            .create_tag_assignment(tag.tag_id, instance_id)
            .await
    }

    async fn find_private_network(
        &self,
        name: &str,
    ) -> Result<Option<PrivateNetwork>, DirectoryError> {
        let mut page = 1;
        loop {
            let batch = self
                .directory
                .list_private_networks(page, self.config.page_size)
                .await?;
            if let Some(network) = batch.items.iter().find(|n| n.name == name) {
                return Ok(Some(network.clone()));
            }
            if batch.is_last() {
                return Ok(None);
            }
            page += 1;
        }
    }

    /// Attaches the instance to the cluster's private network and waits
    /// until the provider hands it a private address.
    async fn ensure_private_network(
        &self,
        cluster_id: &str,
        instance_id: i64,
    ) -> Result<(), ProvisionError> {
        let name = Self::cluster_tag_name(cluster_id);
        let network = match self.find_private_network(&name).await? {
            Some(network) => network,
            None => self.directory.create_private_network(&name).await?,
        };
        self.directory
            .assign_private_network(network.network_id, instance_id)
            .await?;
        let directory = &self.directory;
        poll_until(
            &format!("instance {} to get a private address", instance_id),
            &self.config.status_poll,
            || async move {
                let instance = directory.get_instance(instance_id).await?;
                Ok::<_, DirectoryError>(instance.private_ipv4.map(|_| ()))
            },
        )
        .await
        .map_err(|e| ProvisionError::StatusTimeout {
            instance_id,
            expected: InstanceStatus::Running,
            detail: e.to_string(),
        })
    }

    /// Parks a failed instance: records the failure reason in its display
    /// name for operators, detaches it from the cluster index and powers it
    /// off. Everything here is best-effort; the claim retry loop proceeds
    /// regardless.
    async fn release_failed(&self, cluster_id: &str, instance_id: i64, reason: &str) {
        let parked = Label::Failed {
            reason: reason.to_owned(),
        }
        .encode();
        if let Err(e) = self.directory.set_display_name(instance_id, &parked).await {
            warn!(instance_id, error = %e, "failed to park instance display name");
        }
        if self.config.use_tags {
            if let Err(e) = self.remove_membership(cluster_id, instance_id).await {
                warn!(instance_id, error = %e, "failed to remove tag assignment");
            }
        }
        if let Err(e) = self.directory.stop_instance(instance_id).await {
            warn!(instance_id, error = %e, "failed to stop released instance");
        }
    }

    /// Drops the instance from the cluster tag, deleting the tag itself
    /// once its last assignment is gone.
    async fn remove_membership(
        &self,
        cluster_id: &str,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let name = Self::cluster_tag_name(cluster_id);
        if let Some(tag) = self.find_tag(&name).await? {
            self.directory
                .delete_tag_assignment(tag.tag_id, instance_id)
                .await?;
            let remaining = self.directory.list_tag_assignments(tag.tag_id, 1, 1).await?;
            if remaining.items.is_empty() {
                self.directory.delete_tag(tag.tag_id).await?;
            }
        }
        Ok(())
    }

    async fn remove_private_network(
        &self,
        cluster_id: &str,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let name = Self::cluster_tag_name(cluster_id);
        if let Some(network) = self.find_private_network(&name).await? {
            self.directory
                .unassign_private_network(network.network_id, instance_id)
                .await?;
            let observed = match self.find_private_network(&name).await? {
                Some(network) => network,
                None => return Ok(()),
            };
            if observed.instance_ids.is_empty() {
                self.directory
                    .delete_private_network(observed.network_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Locates the instance backing a node, if it still carries the
    /// cluster's membership marker.
    async fn find_member_instance(
        &self,
        cluster_id: &str,
        node_id: &str,
    ) -> Result<Option<Instance>, DirectoryError> {
        let mut page = 1;
        loop {
            let batch = self
                .directory
                .list_instances(page, self.config.page_size)
                .await?;
            let last = batch.is_last();
            for instance in batch.items {
                if let Label::Claimed(label) = Label::decode(&instance.display_name) {
                    if label.cluster_id == cluster_id && label.node_id == node_id {
                        return Ok(Some(instance));
                    }
                }
            }
            if last {
                return Ok(None);
            }
            page += 1;
        }
    }

    async fn resolve_peers(
        &self,
        request: &ProvisionRequest,
        exclude_node_id: &str,
    ) -> Result<Vec<Node>, ProvisionError> {
        let all: Vec<Node> = self
            .list_nodes(&request.cluster_id)
            .try_collect()
            .await?;
        Ok(all
            .into_iter()
            .filter(|node| node.id != exclude_node_id)
            .filter(|node| match &request.peer_node_ids {
                Some(ids) => ids.contains(&node.id),
                None => true,
            })
            .collect())
    }
}

#[async_trait]
impl<D: InstanceDirectory + 'static> Provision for NodeProvisioner<D> {
    #[instrument(level = "info", skip(self, request), fields(cluster_id = %request.cluster_id))]
    async fn provision_node(&self, request: ProvisionRequest) -> Result<Node, ProvisionError> {
        let secret_id = self.ensure_ssh_secret(&request.ssh_public_key).await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let label = NodeLabel::new(
                request.cluster_id.clone(),
                Self::generate_node_id(),
                request.roles.clone(),
                request.endpoint,
            );
            // A "no capacity" failure propagates straight out of here: it is
            // a hard stop, not something another attempt can fix.
            let instance = self.claim_candidate(&request, &label).await?;
            let instance_id = instance.instance_id;

            let result = async {
                let instance = self.ensure_installed(instance, secret_id).await?;
                self.register_membership(&request.cluster_id, instance.instance_id)
                    .await?;
                if self.config.private_networking {
                    self.ensure_private_network(&request.cluster_id, instance.instance_id)
                        .await?;
                }
                // Fresh read so the node carries the final addresses.
                let instance = self.directory.get_instance(instance.instance_id).await?;
                Node::from_instance(&request.cluster_id, &instance)
                    .ok_or(ProvisionError::MissingAddress(instance.instance_id))
            }
            .await;

            let node = match result {
                Ok(node) => node,
                Err(e) => {
                    self.release_failed(&request.cluster_id, instance_id, "install")
                        .await;
                    return Err(e);
                }
            };

            let peers = self.resolve_peers(&request, &node.id).await?;
            match verify_node(self.runner.as_ref(), &self.config, &node, &peers).await {
                Ok(()) => {
                    info!(node_id = %node.id, instance_id, "node provisioned and verified");
                    return Ok(node);
                }
                Err(err) => {
                    warn!(
                        node_id = %node.id,
                        instance_id,
                        attempt,
                        error = %err,
                        "verification failed, releasing instance"
                    );
                    self.release_failed(&request.cluster_id, instance_id, &err.check.to_string())
                        .await;
                    if attempt >= self.config.provision_attempts {
                        return Err(ProvisionError::AttemptsExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                }
            }
        }
    }

    #[instrument(level = "info", skip(self))]
    async fn deprovision_node(
        &self,
        cluster_id: &str,
        node_id: &str,
    ) -> Result<(), ProvisionError> {
        let instance = match self.find_member_instance(cluster_id, node_id).await? {
            Some(instance) => instance,
            None => {
                debug!(cluster_id, node_id, "node already deprovisioned");
                return Ok(());
            }
        };
        if self.config.use_tags {
            if let Err(e) = self.remove_membership(cluster_id, instance.instance_id).await {
                warn!(instance_id = instance.instance_id, error = %e, "failed to remove tag assignment");
            }
        }
        if self.config.private_networking {
            if let Err(e) = self
                .remove_private_network(cluster_id, instance.instance_id)
                .await
            {
                warn!(instance_id = instance.instance_id, error = %e, "failed to detach private network");
            }
        }
        self.directory
            .set_display_name(instance.instance_id, "")
            .await?;
        self.directory.stop_instance(instance.instance_id).await?;
        info!(
            cluster_id,
            node_id,
            instance_id = instance.instance_id,
            "instance returned to the pool"
        );
        Ok(())
    }

    fn list_nodes(&self, cluster_id: &str) -> BoxStream<'static, Result<Node, ProvisionError>> {
        let directory = Arc::clone(&self.directory);
        let cluster_id = cluster_id.to_owned();
        let size = self.config.page_size;
        Box::pin(try_stream! {
            let mut page = 1u32;
            loop {
                let batch = directory.list_instances(page, size).await?;
                let last = batch.is_last();
                for instance in batch.items {
                    if let Some(node) = Node::from_instance(&cluster_id, &instance) {
                        yield node;
                    }
                }
                if last {
                    break;
                }
                page += 1;
            }
        })
    }

    async fn get_node(&self, cluster_id: &str, node_id: &str) -> Result<Node, ProvisionError> {
        let mut nodes = self.list_nodes(cluster_id);
        while let Some(node) = nodes.try_next().await? {
            if node.id == node_id {
                return Ok(node);
            }
        }
        Err(ProvisionError::NodeNotFound {
            cluster_id: cluster_id.to_owned(),
            node_id: node_id.to_owned(),
        })
    }
}
