//! The cluster lifecycle operations.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::TryStreamExt;
use provisioner::poll::PollSettings;
use provisioner::ssh::{CommandRunner, Output, SshOptions};
use provisioner::{Node, NodeRole, Provision, ProvisionRequest};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bootstrap::{self, Cni, ETCD_DATA_DIR};
use crate::errors::AdminError;
use crate::etcd::{
    parse_alarm_list, parse_endpoint_health, parse_member_list, EtcdBackup, EtcdHealthStatus,
    SnapshotStatus, ETCDCTL,
};
use crate::versions::{self, VersionStrategy};

const INIT_CONFIG_PATH: &str = "/etc/kubernetes/kubeforge-init.yaml";
const BACKUP_DIR: &str = "/var/backups/etcd";
const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// Settings for the administrator.
#[derive(Clone, Debug)]
pub struct AdminConfig {
    /// The SSH public key injected into every provisioned node.
    pub ssh_public_key: String,
    /// Options for ordinary remote commands.
    pub ssh: SshOptions,
    /// Single-attempt budget for the slow commands: dependency install,
    /// kubeadm init/join/upgrade, drains and snapshots.
    pub slow_command_timeout: Duration,
    /// Budget for etcd health to converge after a restart.
    pub health_poll: PollSettings,
}

impl AdminConfig {
    /// Defaults around the given public key.
    pub fn new(ssh_public_key: impl Into<String>) -> Self {
        Self {
            ssh_public_key: ssh_public_key.into(),
            ssh: SshOptions::default(),
            slow_command_timeout: Duration::from_secs(600),
            health_poll: PollSettings::new(Duration::from_secs(180), Duration::from_secs(10)),
        }
    }
}

/// Options for bootstrapping a new cluster.
#[derive(Clone, Debug)]
pub struct InitOptions {
    /// Cluster id. Generated when absent.
    pub cluster_id: Option<String>,
    /// Pod network CIDR.
    pub pod_cidr: String,
    /// Service network CIDR.
    pub service_cidr: String,
    /// Pod network fabric applied after init.
    pub cni: Cni,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            cluster_id: None,
            pod_cidr: "10.244.0.0/16".to_owned(),
            service_cidr: "10.96.0.0/12".to_owned(),
            cni: Cni::Flannel,
        }
    }
}

/// Drives clusters through their lifecycle over SSH, on nodes supplied by a
/// [`Provision`] implementation.
///
/// The administrator is stateless: every operation reconstructs cluster
/// membership from the instance pool, and the cluster-level state machine
/// lives entirely in the nodes' labels. `init_cluster` creates the first
/// (endpoint) control plane, `add_node` and `remove_node` grow and shrink
/// the member set, and `delete_cluster` tears everything down.
pub struct Administrator<P> {
    provisioner: P,
    runner: Arc<dyn CommandRunner>,
    strategy: Box<dyn VersionStrategy>,
    config: AdminConfig,
}

impl<P: Provision> Administrator<P> {
    /// An administrator for the given Kubernetes version tag. Unsupported
    /// versions fail here, before any cloud or SSH call is made.
    pub fn new(
        provisioner: P,
        runner: Arc<dyn CommandRunner>,
        version: &str,
        config: AdminConfig,
    ) -> Result<Self, AdminError> {
        let strategy = versions::resolve(version)?;
        Ok(Self {
            provisioner,
            runner,
            strategy,
            config,
        })
    }

    fn generate_cluster_id() -> String {
        let mut id = Uuid::new_v4().to_simple().to_string();
        id.truncate(8);
        id
    }

    fn kubectl(args: &str) -> String {
        format!("kubectl --kubeconfig {} {}", ADMIN_KUBECONFIG, args)
    }

    async fn ssh(&self, node: &Node, command: &str, context: &str) -> Result<Output, AdminError> {
        self.ssh_with(node, command, &self.config.ssh, context).await
    }

    async fn ssh_slow(
        &self,
        node: &Node,
        command: &str,
        context: &str,
    ) -> Result<Output, AdminError> {
        let options = SshOptions {
            timeout: self.config.slow_command_timeout,
            retries: 1,
            stdin: None,
        };
        self.ssh_with(node, command, &options, context).await
    }

    async fn ssh_with(
        &self,
        node: &Node,
        command: &str,
        options: &SshOptions,
        context: &str,
    ) -> Result<Output, AdminError> {
        self.runner
            .ssh(node.public_ip, command, options)
            .await
            .map_err(|e| AdminError::Remote {
                context: context.to_owned(),
                node_id: node.id.clone(),
                source: e,
            })
    }

    /// A snapshot of the cluster's nodes.
    pub async fn nodes(&self, cluster_id: &str) -> Result<Vec<Node>, AdminError> {
        let nodes = self
            .provisioner
            .list_nodes(cluster_id)
            .try_collect()
            .await?;
        Ok(nodes)
    }

    /// The first control-plane node that answers SSH.
    async fn reachable_control_plane(
        &self,
        cluster_id: &str,
        nodes: &[Node],
    ) -> Result<Node, AdminError> {
        let mut any = false;
        for node in nodes.iter().filter(|n| n.is_control_plane()) {
            any = true;
            match self.runner.ssh(node.public_ip, "true", &self.config.ssh).await {
                Ok(_) => return Ok(node.clone()),
                Err(e) => debug!(node_id = %node.id, error = %e, "control plane unreachable"),
            }
        }
        if any {
            Err(AdminError::NoReachableControlPlane(cluster_id.to_owned()))
        } else {
            Err(AdminError::NoControlPlane(cluster_id.to_owned()))
        }
    }

    /// Clears any pre-existing Kubernetes state. kubeadm tolerates a node
    /// with nothing to reset, and so does this.
    async fn reset_node(&self, node: &Node) {
        match self
            .ssh_slow(node, "kubeadm reset --force", "kubernetes state reset")
            .await
        {
            Ok(_) => debug!(node_id = %node.id, "node reset"),
            Err(e) => debug!(node_id = %node.id, error = %e, "reset reported an error, continuing"),
        }
    }

    async fn install_dependencies(&self, node: &Node) -> Result<(), AdminError> {
        info!(node_id = %node.id, version = self.strategy.version(), "installing node dependencies");
        self.ssh_slow(node, &self.strategy.install_script(), "dependency install")
            .await?;
        Ok(())
    }

    /// Bootstraps a new cluster and returns its id.
    ///
    /// The single node provisioned here becomes, by convention, the
    /// cluster's permanent API endpoint; its label carries the endpoint
    /// marker so `remove_node` can refuse to take it away. A failure after
    /// provisioning leaves a partially bootstrapped node behind; rollback
    /// is deliberately not attempted, operators re-run `delete_cluster` and
    /// `init_cluster`.
    #[instrument(level = "info", skip(self, options))]
    pub async fn init_cluster(&self, options: InitOptions) -> Result<String, AdminError> {
        let cluster_id = options
            .cluster_id
            .clone()
            .unwrap_or_else(Self::generate_cluster_id);
        info!(%cluster_id, "bootstrapping cluster");

        let mut request = ProvisionRequest::new(
            &cluster_id,
            &self.config.ssh_public_key,
            [NodeRole::ControlPlane].into_iter().collect(),
        );
        request.endpoint = true;
        let node = self.provisioner.provision_node(request).await?;

        self.reset_node(&node).await;
        self.install_dependencies(&node).await?;

        let config_yaml = bootstrap::render_init_config(
            self.strategy.kubernetes_version(),
            &options.pod_cidr,
            &options.service_cidr,
        )?;
        let write = SshOptions::with_stdin(config_yaml);
        self.ssh_with(
            &node,
            &format!("mkdir -p /etc/kubernetes && cat > {}", INIT_CONFIG_PATH),
            &write,
            "bootstrap config write",
        )
        .await?;

        self.ssh_slow(
            &node,
            &format!(
                "kubeadm init --config {} --node-name {}",
                INIT_CONFIG_PATH, node.name
            ),
            "kubeadm init",
        )
        .await?;

        info!(%cluster_id, cni = %options.cni, "applying pod network manifest");
        self.ssh_slow(
            &node,
            &Self::kubectl(&format!("apply -f {}", options.cni.manifest_url())),
            "pod network apply",
        )
        .await?;

        info!(%cluster_id, node_id = %node.id, "cluster bootstrapped");
        Ok(cluster_id)
    }

    /// Provisions a new node and joins it to the cluster. Every call adds
    /// one more node; this is intentionally not idempotent at the
    /// membership level.
    #[instrument(level = "info", skip(self, roles))]
    pub async fn add_node(
        &self,
        cluster_id: &str,
        roles: BTreeSet<NodeRole>,
    ) -> Result<Node, AdminError> {
        let nodes = self.nodes(cluster_id).await?;
        let coordinator = nodes
            .iter()
            .find(|n| n.is_control_plane())
            .cloned()
            .ok_or_else(|| AdminError::NoControlPlane(cluster_id.to_owned()))?;

        let request =
            ProvisionRequest::new(cluster_id, &self.config.ssh_public_key, roles.clone());
        let node = self.provisioner.provision_node(request).await?;

        self.reset_node(&node).await;
        self.install_dependencies(&node).await?;

        let token_output = self
            .ssh(
                &coordinator,
                "kubeadm token create --print-join-command --ttl 1h",
                "join token creation",
            )
            .await?;
        let mut join_command = token_output.stdout_trimmed().to_owned();
        if join_command.is_empty() {
            return Err(AdminError::EmptyJoinCommand(coordinator.id.clone()));
        }

        if roles.contains(&NodeRole::ControlPlane) {
            let certs_output = self
                .ssh(
                    &coordinator,
                    "kubeadm init phase upload-certs --upload-certs | tail -n 1",
                    "certificate key upload",
                )
                .await?;
            join_command.push_str(&format!(
                " --control-plane --certificate-key {}",
                certs_output.stdout_trimmed()
            ));
        }
        join_command.push_str(&format!(" --node-name {}", node.name));

        self.ssh_slow(&node, &join_command, "kubeadm join").await?;

        for role in &roles {
            self.ssh(
                &coordinator,
                &Self::kubectl(&format!(
                    "label node {} node-role.kubernetes.io/{}= --overwrite",
                    node.name, role
                )),
                "node role labeling",
            )
            .await?;
        }

        info!(node_id = %node.id, "node joined the cluster");
        Ok(node)
    }

    /// Drains a node, removes it from the cluster and returns its instance
    /// to the pool.
    #[instrument(level = "info", skip(self))]
    pub async fn remove_node(&self, cluster_id: &str, node_id: &str) -> Result<(), AdminError> {
        let node = self.provisioner.get_node(cluster_id, node_id).await?;
        let nodes = self.nodes(cluster_id).await?;
        let others: Vec<&Node> = nodes.iter().filter(|n| n.id != node.id).collect();

        // Both guards run before anything is mutated.
        if node.endpoint && !others.is_empty() {
            return Err(AdminError::EndpointNode(node.id));
        }
        let coordinator = others
            .iter()
            .find(|n| n.is_control_plane())
            .copied()
            .cloned()
            .ok_or_else(|| AdminError::LastControlPlane(node.id.clone()))?;

        self.ssh_slow(
            &coordinator,
            &Self::kubectl(&format!(
                "drain {} --ignore-daemonsets --delete-emptydir-data --force --timeout=120s",
                node.name
            )),
            "node drain",
        )
        .await?;
        self.ssh(
            &coordinator,
            &Self::kubectl(&format!("delete node {}", node.name)),
            "node object deletion",
        )
        .await?;

        // Best-effort: the node is out of the cluster either way.
        match self
            .ssh_slow(&node, "kubeadm reset --force", "kubernetes state reset")
            .await
        {
            Ok(_) => {}
            Err(e) => warn!(node_id = %node.id, error = %e, "reset failed on removed node"),
        }

        self.provisioner.deprovision_node(cluster_id, node_id).await?;
        info!(node_id = %node.id, "node removed");
        Ok(())
    }

    /// Tears down every node of the cluster. Per-node failures are logged
    /// and do not stop the teardown of the others; the cluster is gone once
    /// no instance carries its membership marker.
    #[instrument(level = "info", skip(self))]
    pub async fn delete_cluster(&self, cluster_id: &str) -> Result<(), AdminError> {
        let nodes = self.nodes(cluster_id).await?;
        info!(count = nodes.len(), "deleting cluster nodes");

        let results = join_all(nodes.iter().map(|node| async move {
            self.reset_node(node).await;
            self.provisioner
                .deprovision_node(cluster_id, &node.id)
                .await
                .map_err(|e| (node.id.clone(), e))
        }))
        .await;

        let mut failures = 0;
        for result in results {
            if let Err((node_id, e)) = result {
                failures += 1;
                warn!(%node_id, error = %e, "failed to deprovision node during teardown");
            }
        }
        if failures > 0 {
            warn!(failures, "cluster deleted with partial cleanup failures");
        } else {
            info!("cluster deleted");
        }
        Ok(())
    }

    /// Runs the three read-only etcd diagnostics on `node` and folds their
    /// output into a health status.
    async fn etcd_status_on(&self, node: &Node) -> Result<EtcdHealthStatus, AdminError> {
        // The diagnostics exit non-zero on unhealthy clusters; their output
        // is the answer either way, so exit status is deliberately ignored.
        let health = self
            .ssh(
                node,
                &format!("{} endpoint health --cluster 2>&1 || true", ETCDCTL),
                "etcd endpoint health",
            )
            .await?;
        let members = self
            .ssh(
                node,
                &format!("{} member list 2>&1 || true", ETCDCTL),
                "etcd member list",
            )
            .await?;
        let alarms = self
            .ssh(
                node,
                &format!("{} alarm list 2>&1 || true", ETCDCTL),
                "etcd alarm list",
            )
            .await?;

        let (healthy_endpoints, total_endpoints) = parse_endpoint_health(&health.stdout);
        let has_alarms = parse_alarm_list(&alarms.stdout);
        Ok(EtcdHealthStatus {
            healthy: total_endpoints > 0
                && healthy_endpoints == total_endpoints
                && !has_alarms,
            healthy_endpoints,
            total_endpoints,
            members: parse_member_list(&members.stdout),
            has_alarms,
            raw_outputs: vec![health.stdout, members.stdout, alarms.stdout],
        })
    }

    /// Computes a fresh etcd health status from any reachable control
    /// plane.
    #[instrument(level = "info", skip(self))]
    pub async fn check_etcd_health(
        &self,
        cluster_id: &str,
    ) -> Result<EtcdHealthStatus, AdminError> {
        let nodes = self.nodes(cluster_id).await?;
        let node = self.reachable_control_plane(cluster_id, &nodes).await?;
        self.etcd_status_on(&node).await
    }

    /// Polls after a disruptive etcd operation until the cluster reports
    /// full health, or gives up with the last observed counts.
    async fn wait_until_healthy(&self, node: &Node) -> Result<EtcdHealthStatus, AdminError> {
        let deadline = tokio::time::Instant::now() + self.config.health_poll.timeout;
        loop {
            let status = self.etcd_status_on(node).await?;
            if status.healthy {
                return Ok(status);
            }
            if tokio::time::Instant::now() + self.config.health_poll.interval > deadline {
                return Err(AdminError::EtcdUnhealthy {
                    healthy: status.healthy_endpoints,
                    total: status.total_endpoints,
                });
            }
            debug!(
                healthy = status.healthy_endpoints,
                total = status.total_endpoints,
                "etcd not fully healthy yet"
            );
            tokio::time::sleep(self.config.health_poll.interval).await;
        }
    }

    /// Snapshots etcd to a timestamped path and verifies the snapshot's
    /// integrity before reporting success. A snapshot that fails
    /// verification is an error, never a silently corrupt file.
    #[instrument(level = "info", skip(self))]
    pub async fn backup_etcd(&self, cluster_id: &str) -> Result<EtcdBackup, AdminError> {
        let nodes = self.nodes(cluster_id).await?;
        let node = self.reachable_control_plane(cluster_id, &nodes).await?;

        let path = format!(
            "{}/etcd-{}.db",
            BACKUP_DIR,
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        self.ssh(&node, &format!("mkdir -p {}", BACKUP_DIR), "backup dir creation")
            .await?;
        self.ssh_slow(
            &node,
            &format!("{} snapshot save {}", ETCDCTL, path),
            "etcd snapshot",
        )
        .await?;

        let status_output = self
            .ssh(
                &node,
                &format!("etcdutl snapshot status {} --write-out=json", path),
                "snapshot verification",
            )
            .await?;
        let status: SnapshotStatus = serde_json::from_str(status_output.stdout_trimmed())
            .map_err(|e| AdminError::BackupVerificationFailed {
                path: path.clone(),
                reason: format!("unparseable status output: {}", e),
            })?;
        if status.total_size == 0 {
            return Err(AdminError::BackupVerificationFailed {
                path,
                reason: "snapshot reports zero size".to_owned(),
            });
        }

        info!(%path, size = status.total_size, keys = status.total_key, "etcd backup verified");
        Ok(EtcdBackup {
            node_id: node.id.clone(),
            path,
            total_size: status.total_size,
            total_keys: status.total_key,
        })
    }

    /// Restores an etcd snapshot across the control plane.
    ///
    /// Stops the kubelet and etcd on every control-plane node, restores the
    /// snapshot into a fresh data directory on one node, swaps it into
    /// place, restarts the kubelets and waits for health. Only the one
    /// node's data is re-seeded; the other members are expected to rejoin
    /// the restored member, and the final health gate fails loudly when
    /// they do not.
    #[instrument(level = "info", skip(self))]
    pub async fn restore_etcd(
        &self,
        cluster_id: &str,
        snapshot_path: &str,
    ) -> Result<(), AdminError> {
        let nodes = self.nodes(cluster_id).await?;
        let control_planes: Vec<&Node> =
            nodes.iter().filter(|n| n.is_control_plane()).collect();
        let target = control_planes
            .first()
            .copied()
            .ok_or_else(|| AdminError::NoControlPlane(cluster_id.to_owned()))?;

        for node in &control_planes {
            self.ssh(
                node,
                "systemctl stop kubelet && \
                 crictl stop $(crictl ps -q --name etcd) 2>/dev/null || true",
                "etcd shutdown",
            )
            .await?;
        }

        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let restore_dir = format!("{}-restore-{}", ETCD_DATA_DIR, stamp);
        self.ssh_slow(
            target,
            &format!(
                "etcdutl snapshot restore {} --data-dir {}",
                snapshot_path, restore_dir
            ),
            "snapshot restore",
        )
        .await?;
        // Atomic swap: the old data directory is kept for post-mortems.
        self.ssh(
            target,
            &format!(
                "mv {data} {data}-old-{stamp} && mv {restore} {data}",
                data = ETCD_DATA_DIR,
                restore = restore_dir,
                stamp = stamp
            ),
            "data directory swap",
        )
        .await?;

        for node in &control_planes {
            if let Err(e) = self
                .ssh(node, "systemctl start kubelet", "kubelet restart")
                .await
            {
                warn!(node_id = %node.id, error = %e, "failed to restart kubelet after restore");
            }
        }

        self.wait_until_healthy(target).await?;
        info!("etcd restored and healthy");
        Ok(())
    }

    /// Upgrades the control plane to `target_version`, one node at a time.
    ///
    /// Backing up etcd first is mandatory. After each node's upgrade the
    /// etcd process is restarted and the cluster must report full health
    /// before the next node is touched; anything less aborts the upgrade.
    #[instrument(level = "info", skip(self))]
    pub async fn upgrade_cluster(
        &self,
        cluster_id: &str,
        target_version: &str,
    ) -> Result<(), AdminError> {
        let target = versions::resolve(target_version)?;
        let backup = self.backup_etcd(cluster_id).await?;
        info!(path = %backup.path, "pre-upgrade etcd backup taken");

        let nodes = self.nodes(cluster_id).await?;
        let mut control_planes: Vec<&Node> =
            nodes.iter().filter(|n| n.is_control_plane()).collect();
        if control_planes.is_empty() {
            return Err(AdminError::NoControlPlane(cluster_id.to_owned()));
        }
        // The endpoint node runs `upgrade apply`; the rest follow.
        control_planes.sort_by_key(|n| !n.endpoint);

        for (index, node) in control_planes.iter().enumerate() {
            info!(node_id = %node.id, version = target.version(), "upgrading control plane node");
            self.ssh_slow(node, &target.install_script(), "dependency upgrade")
                .await?;
            let command = if index == 0 {
                target.upgrade_apply_command()
            } else {
                target.upgrade_node_command()
            };
            self.ssh_slow(node, &command, "kubeadm upgrade").await?;
            self.ssh(node, "systemctl restart kubelet", "kubelet restart")
                .await?;
            self.wait_until_healthy(node).await?;
        }

        info!(version = target.version(), "cluster upgraded");
        Ok(())
    }
}
