use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cloud_api::{ClientConfig, DirectoryClient};
use cluster_admin::{AdminConfig, Administrator, Cni, InitOptions};
use provisioner::ssh::Ssh;
use provisioner::{Config, NodeProvisioner, NodeRole};
use structopt::StructOpt;
use url::Url;

#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "kubeforge",
    about = "Provision and administer Kubernetes clusters on a reusable pool of cloud instances"
)]
struct Opts {
    #[structopt(
        long = "api-url",
        env = "KUBEFORGE_API_URL",
        help = "Base URL of the cloud provider API, e.g. https://api.example.com/v1/"
    )]
    api_url: Url,

    #[structopt(
        long = "api-token",
        env = "KUBEFORGE_API_TOKEN",
        hide_env_values = true,
        help = "Bearer token for the cloud provider API"
    )]
    api_token: String,

    #[structopt(
        long = "product",
        env = "KUBEFORGE_PRODUCT",
        default_value = "V45",
        help = "Capacity class an instance must have to be claimed from the pool"
    )]
    product: String,

    #[structopt(
        long = "image",
        env = "KUBEFORGE_IMAGE",
        default_value = "ubuntu-22.04",
        help = "OS image nodes must run; mismatched instances are reinstalled"
    )]
    image: String,

    #[structopt(
        long = "region",
        env = "KUBEFORGE_REGION",
        default_value = "EU",
        help = "Region used when the pool is exhausted and a fresh instance is created"
    )]
    region: String,

    #[structopt(
        long = "ssh-user",
        env = "KUBEFORGE_SSH_USER",
        default_value = "root",
        help = "Remote user for node administration"
    )]
    ssh_user: String,

    #[structopt(
        long = "ssh-key",
        env = "KUBEFORGE_SSH_KEY",
        help = "Private key used to authenticate to nodes"
    )]
    ssh_key: PathBuf,

    #[structopt(
        long = "ssh-public-key",
        env = "KUBEFORGE_SSH_PUBLIC_KEY",
        help = "Public key file injected into every provisioned node"
    )]
    ssh_public_key: PathBuf,

    #[structopt(
        long = "kubernetes-version",
        env = "KUBEFORGE_KUBERNETES_VERSION",
        default_value = "1.32",
        help = "Kubernetes minor version to install on new nodes"
    )]
    kubernetes_version: String,

    #[structopt(
        long = "private-networking",
        help = "Attach cluster nodes to a per-cluster private network"
    )]
    private_networking: bool,

    #[structopt(
        long = "no-auto-provision",
        help = "Fail with 'no capacity' instead of creating fresh instances when the pool is exhausted"
    )]
    no_auto_provision: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Clone, Debug)]
enum Command {
    /// Bootstrap a new cluster and print its id
    CreateCluster {
        #[structopt(long = "cluster-id", help = "Cluster id; generated when omitted")]
        cluster_id: Option<String>,
        #[structopt(long = "pod-cidr", default_value = "10.244.0.0/16")]
        pod_cidr: String,
        #[structopt(long = "service-cidr", default_value = "10.96.0.0/12")]
        service_cidr: String,
        #[structopt(
            long = "cni",
            default_value = "flannel",
            help = "Pod network fabric (flannel or calico)"
        )]
        cni: Cni,
    },
    /// Provision a node and join it to a cluster
    AddNode {
        cluster_id: String,
        #[structopt(
            long = "role",
            default_value = "worker",
            use_delimiter = true,
            help = "Roles for the new node (worker, control-plane)"
        )]
        roles: Vec<NodeRole>,
    },
    /// Drain a node, remove it from the cluster and return its instance to the pool
    RemoveNode { cluster_id: String, node_id: String },
    /// List a cluster's nodes
    ListNodes { cluster_id: String },
    /// Tear down every node of a cluster
    DeleteCluster { cluster_id: String },
    /// Upgrade the control plane to another supported version
    UpgradeCluster { cluster_id: String, version: String },
    /// Snapshot etcd and verify the snapshot
    BackupEtcd { cluster_id: String },
    /// Restore an etcd snapshot across the control plane
    RestoreEtcd {
        cluster_id: String,
        snapshot_path: String,
    },
    /// Report etcd health from the first reachable control plane
    EtcdHealth { cluster_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let public_key = std::fs::read_to_string(&opts.ssh_public_key).with_context(|| {
        format!(
            "failed to read SSH public key {}",
            opts.ssh_public_key.display()
        )
    })?;

    let directory = Arc::new(DirectoryClient::new(ClientConfig::new(
        opts.api_url.clone(),
        opts.api_token.clone(),
    ))?);
    let runner = Arc::new(Ssh::new(opts.ssh_user.clone(), opts.ssh_key.clone()));

    let mut config = Config::new(
        opts.product.clone(),
        opts.image.clone(),
        opts.region.clone(),
    );
    config.private_networking = opts.private_networking;
    config.auto_provision = !opts.no_auto_provision;

    let provisioner = NodeProvisioner::new(directory, runner.clone(), config);
    let admin = Administrator::new(
        provisioner,
        runner,
        &opts.kubernetes_version,
        AdminConfig::new(public_key.trim()),
    )?;

    match opts.command {
        Command::CreateCluster {
            cluster_id,
            pod_cidr,
            service_cidr,
            cni,
        } => {
            let cluster_id = admin
                .init_cluster(InitOptions {
                    cluster_id,
                    pod_cidr,
                    service_cidr,
                    cni,
                })
                .await?;
            println!("{}", cluster_id);
        }
        Command::AddNode { cluster_id, roles } => {
            let roles: BTreeSet<NodeRole> = roles.into_iter().collect();
            let node = admin.add_node(&cluster_id, roles).await?;
            println!("{} {}", node.id, node.public_ip);
        }
        Command::RemoveNode {
            cluster_id,
            node_id,
        } => {
            admin.remove_node(&cluster_id, &node_id).await?;
        }
        Command::ListNodes { cluster_id } => {
            for node in admin.nodes(&cluster_id).await? {
                let roles = node
                    .roles
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                println!(
                    "{}\t{}\t{}\t{}",
                    node.id,
                    node.public_ip,
                    roles,
                    if node.endpoint { "endpoint" } else { "-" }
                );
            }
        }
        Command::DeleteCluster { cluster_id } => {
            admin.delete_cluster(&cluster_id).await?;
        }
        Command::UpgradeCluster {
            cluster_id,
            version,
        } => {
            admin.upgrade_cluster(&cluster_id, &version).await?;
        }
        Command::BackupEtcd { cluster_id } => {
            let backup = admin.backup_etcd(&cluster_id).await?;
            println!(
                "{} ({} keys, {} bytes) on node {}",
                backup.path, backup.total_keys, backup.total_size, backup.node_id
            );
        }
        Command::RestoreEtcd {
            cluster_id,
            snapshot_path,
        } => {
            admin.restore_etcd(&cluster_id, &snapshot_path).await?;
        }
        Command::EtcdHealth { cluster_id } => {
            let status = admin.check_etcd_health(&cluster_id).await?;
            for member in &status.members {
                println!("{}\t{}\t{}", member.id, member.name, member.status);
            }
            println!(
                "healthy: {} ({}/{} endpoints, alarms: {})",
                status.healthy, status.healthy_endpoints, status.total_endpoints, status.has_alarms
            );
            if !status.healthy {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
