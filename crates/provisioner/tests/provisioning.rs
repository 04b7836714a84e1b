//! End-to-end provisioning scenarios against the in-memory directory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloud_api::{InMemoryDirectory, InstanceDirectory, InstanceStatus};
use futures::TryStreamExt;
use provisioner::poll::PollSettings;
use provisioner::ssh::{CommandRunner, Output, SshOptions};
use provisioner::{Config, NodeProvisioner, NodeRole, Provision, ProvisionError, ProvisionRequest};

const PRODUCT: &str = "V45";
const IMAGE: &str = "ubuntu-22.04";
const KEY: &str = "ssh-ed25519 AAAA test@host";

/// A runner on which every local and remote command succeeds.
struct HealthyRunner;

#[async_trait]
impl CommandRunner for HealthyRunner {
    async fn exec(&self, _command: &str) -> anyhow::Result<Output> {
        Ok(Output::default())
    }

    async fn ssh(
        &self,
        _host: std::net::IpAddr,
        _command: &str,
        _options: &SshOptions,
    ) -> anyhow::Result<Output> {
        Ok(Output::default())
    }
}

/// A runner that answers ping locally but refuses every SSH connection, so
/// verification always fails at the SSH check.
struct SshDeadRunner {
    ssh_calls: AtomicUsize,
}

impl SshDeadRunner {
    fn new() -> Self {
        Self {
            ssh_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CommandRunner for SshDeadRunner {
    async fn exec(&self, _command: &str) -> anyhow::Result<Output> {
        Ok(Output::default())
    }

    async fn ssh(
        &self,
        host: std::net::IpAddr,
        _command: &str,
        _options: &SshOptions,
    ) -> anyhow::Result<Output> {
        self.ssh_calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("connection refused by {}", host))
    }
}

fn fast_config() -> Config {
    let mut config = Config::new(PRODUCT, IMAGE, "EU");
    config.status_poll = PollSettings::new(Duration::from_millis(100), Duration::from_millis(1));
    config.ping_poll = PollSettings::new(Duration::from_millis(100), Duration::from_millis(1));
    config.check_ssh = SshOptions {
        timeout: Duration::from_millis(100),
        retries: 1,
        stdin: None,
    };
    config
}

fn provisioner_with(
    directory: Arc<InMemoryDirectory>,
    runner: Arc<dyn CommandRunner>,
    config: Config,
) -> NodeProvisioner<InMemoryDirectory> {
    NodeProvisioner::new(directory, runner, config)
}

fn request(cluster_id: &str) -> ProvisionRequest {
    ProvisionRequest::new(
        cluster_id,
        KEY,
        [NodeRole::Worker].into_iter().collect(),
    )
}

#[tokio::test]
async fn concurrent_requests_claim_distinct_instances() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(4, PRODUCT, IMAGE).await;
    let provisioner = provisioner_with(
        Arc::clone(&directory),
        Arc::new(HealthyRunner),
        fast_config(),
    );

    let (a, b, c) = tokio::join!(
        provisioner.provision_node(request("prod")),
        provisioner.provision_node(request("prod")),
        provisioner.provision_node(request("prod")),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    let c = c.unwrap();

    let mut instance_ids = vec![a.instance_id, b.instance_id, c.instance_id];
    instance_ids.sort_unstable();
    instance_ids.dedup();
    assert_eq!(instance_ids.len(), 3, "two nodes share an instance");

    let nodes: Vec<_> = provisioner.list_nodes("prod").try_collect().await.unwrap();
    assert_eq!(nodes.len(), 3);
}

#[tokio::test]
async fn empty_pool_without_auto_provision_is_no_capacity() {
    let directory = Arc::new(InMemoryDirectory::new());
    let mut config = fast_config();
    config.auto_provision = false;
    let provisioner = provisioner_with(directory, Arc::new(HealthyRunner), config);

    let err = provisioner.provision_node(request("prod")).await.unwrap_err();
    assert!(matches!(err, ProvisionError::NoCapacity));
}

#[tokio::test]
async fn pool_exhaustion_falls_back_to_instance_creation() {
    let directory = Arc::new(InMemoryDirectory::new());
    let provisioner = provisioner_with(
        Arc::clone(&directory),
        Arc::new(HealthyRunner),
        fast_config(),
    );

    let node = provisioner.provision_node(request("prod")).await.unwrap();
    let instance = directory.snapshot(node.instance_id).await.unwrap();
    // The fresh instance is born with the claim in place, never unclaimed.
    assert!(instance.display_name.contains("cluster=prod"));
    assert_eq!(instance.image_id, IMAGE);
}

#[tokio::test]
async fn candidate_with_wrong_image_is_reinstalled() {
    let directory = Arc::new(InMemoryDirectory::new());
    let ids = directory.seed_pool(1, PRODUCT, "debian-11").await;
    let provisioner = provisioner_with(
        Arc::clone(&directory),
        Arc::new(HealthyRunner),
        fast_config(),
    );

    let node = provisioner.provision_node(request("prod")).await.unwrap();
    assert_eq!(node.instance_id, ids[0]);
    let instance = directory.snapshot(ids[0]).await.unwrap();
    assert_eq!(instance.image_id, IMAGE);
    assert!(
        !instance.ssh_keys.is_empty(),
        "reinstall must inject the requested key"
    );
}

#[tokio::test]
async fn foreign_display_names_are_never_claimed() {
    let directory = Arc::new(InMemoryDirectory::new());
    let ids = directory.seed_pool(1, PRODUCT, IMAGE).await;
    directory
        .set_display_name(ids[0], "bastion, do not touch")
        .await
        .unwrap();
    let mut config = fast_config();
    config.auto_provision = false;
    let provisioner = provisioner_with(
        Arc::clone(&directory),
        Arc::new(HealthyRunner),
        config,
    );

    let err = provisioner.provision_node(request("prod")).await.unwrap_err();
    assert!(matches!(err, ProvisionError::NoCapacity));
    let instance = directory.snapshot(ids[0]).await.unwrap();
    assert_eq!(instance.display_name, "bastion, do not touch");
}

#[tokio::test]
async fn deprovision_returns_the_instance_and_is_idempotent() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let provisioner = provisioner_with(
        Arc::clone(&directory),
        Arc::new(HealthyRunner),
        fast_config(),
    );

    let node = provisioner.provision_node(request("prod")).await.unwrap();
    assert_eq!(directory.tag_count().await, 1);

    provisioner.deprovision_node("prod", &node.id).await.unwrap();
    let instance = directory.snapshot(node.instance_id).await.unwrap();
    assert_eq!(instance.display_name, "");
    assert_eq!(instance.status, InstanceStatus::Stopped);
    // The cluster's tag disappears with its last member.
    assert_eq!(directory.tag_count().await, 0);

    // Already gone: still Ok.
    provisioner.deprovision_node("prod", &node.id).await.unwrap();
}

#[tokio::test]
async fn private_networking_attaches_and_yields_an_address() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let mut config = fast_config();
    config.private_networking = true;
    let provisioner = provisioner_with(
        Arc::clone(&directory),
        Arc::new(HealthyRunner),
        config,
    );

    let node = provisioner.provision_node(request("prod")).await.unwrap();
    assert!(node.private_ip.is_some());
    let networks = directory.list_private_networks(1, 10).await.unwrap();
    assert_eq!(networks.items.len(), 1);
    assert_eq!(networks.items[0].name, "cluster=prod");
    assert!(networks.items[0].instance_ids.contains(&node.instance_id));

    // Detaching the last member removes the cluster network entirely.
    provisioner.deprovision_node("prod", &node.id).await.unwrap();
    let instance = directory.snapshot(node.instance_id).await.unwrap();
    assert!(instance.private_ipv4.is_none());
    let networks = directory.list_private_networks(1, 10).await.unwrap();
    assert!(networks.items.is_empty());
}

#[tokio::test]
async fn released_instance_is_claimable_by_another_cluster() {
    let directory = Arc::new(InMemoryDirectory::new());
    let ids = directory.seed_pool(1, PRODUCT, IMAGE).await;
    let provisioner = provisioner_with(
        Arc::clone(&directory),
        Arc::new(HealthyRunner),
        fast_config(),
    );

    let first = provisioner.provision_node(request("alpha")).await.unwrap();
    assert_eq!(first.instance_id, ids[0]);
    provisioner.deprovision_node("alpha", &first.id).await.unwrap();

    let mut config = fast_config();
    config.auto_provision = false;
    let provisioner = provisioner_with(
        Arc::clone(&directory),
        Arc::new(HealthyRunner),
        config,
    );
    let second = provisioner.provision_node(request("beta")).await.unwrap();
    assert_eq!(second.instance_id, ids[0]);
    assert_eq!(second.cluster_id, "beta");
}

#[tokio::test]
async fn verification_failure_parks_instances_and_exhausts_attempts() {
    let directory = Arc::new(InMemoryDirectory::new());
    let ids = directory.seed_pool(3, PRODUCT, IMAGE).await;
    let runner = Arc::new(SshDeadRunner::new());
    let mut config = fast_config();
    config.auto_provision = false;
    let provisioner = provisioner_with(Arc::clone(&directory), runner.clone(), config);

    let err = provisioner.provision_node(request("prod")).await.unwrap_err();
    match err {
        ProvisionError::AttemptsExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(source.to_string().contains("ssh"));
        }
        other => panic!("expected AttemptsExhausted, got {}", other),
    }
    assert!(runner.ssh_calls.load(Ordering::SeqCst) >= 3);

    // Each attempt burned a different instance and parked it with the
    // failing check recorded, powered off and out of the pool.
    for id in ids {
        let instance = directory.snapshot(id).await.unwrap();
        assert_eq!(instance.display_name, "error=ssh");
        assert_eq!(instance.status, InstanceStatus::Stopped);
    }
    assert_eq!(directory.tag_count().await, 0);
}

#[tokio::test]
async fn list_nodes_sees_only_its_cluster() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(3, PRODUCT, IMAGE).await;
    let provisioner = provisioner_with(
        Arc::clone(&directory),
        Arc::new(HealthyRunner),
        fast_config(),
    );

    provisioner.provision_node(request("alpha")).await.unwrap();
    provisioner.provision_node(request("alpha")).await.unwrap();
    provisioner.provision_node(request("beta")).await.unwrap();

    let alpha: Vec<_> = provisioner.list_nodes("alpha").try_collect().await.unwrap();
    let beta: Vec<_> = provisioner.list_nodes("beta").try_collect().await.unwrap();
    assert_eq!(alpha.len(), 2);
    assert_eq!(beta.len(), 1);

    let err = provisioner.get_node("beta", &alpha[0].id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::NodeNotFound { .. }));
}
