//! Administrator scenarios over the in-memory directory and a scripted
//! command runner.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloud_api::{InMemoryDirectory, InstanceStatus};
use cluster_admin::{AdminConfig, AdminError, Administrator, InitOptions};
use provisioner::poll::PollSettings;
use provisioner::ssh::{CommandRunner, Output, SshOptions};
use provisioner::{Config, NodeProvisioner, NodeRole};
use tokio::sync::Mutex;

const PRODUCT: &str = "V45";
const IMAGE: &str = "ubuntu-22.04";
const KEY: &str = "ssh-ed25519 AAAA test@host";

const JOIN_COMMAND: &str =
    "kubeadm join 198.51.0.2:6443 --token abc.def --discovery-token-ca-cert-hash sha256:1234";

/// Replays canned stdout for remote commands matched by substring and
/// records everything it was asked to run. Unmatched commands succeed with
/// empty output.
struct ScriptedRunner {
    rules: Vec<(&'static str, Result<&'static str, &'static str>)>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            rules: Vec::new(),
            commands: Mutex::new(Vec::new()),
        }
    }

    fn on(mut self, needle: &'static str, stdout: &'static str) -> Self {
        self.rules.push((needle, Ok(stdout)));
        self
    }

    fn fail_on(mut self, needle: &'static str, message: &'static str) -> Self {
        self.rules.push((needle, Err(message)));
        self
    }

    async fn ran(&self, needle: &str) -> bool {
        self.commands
            .lock()
            .await
            .iter()
            .any(|c| c.contains(needle))
    }

    async fn first_matching(&self, needle: &str) -> Option<String> {
        self.commands
            .lock()
            .await
            .iter()
            .find(|c| c.contains(needle))
            .cloned()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn exec(&self, _command: &str) -> anyhow::Result<Output> {
        Ok(Output::default())
    }

    async fn ssh(
        &self,
        _host: IpAddr,
        command: &str,
        _options: &SshOptions,
    ) -> anyhow::Result<Output> {
        self.commands.lock().await.push(command.to_owned());
        for (needle, outcome) in &self.rules {
            if command.contains(needle) {
                return match outcome {
                    Ok(stdout) => Ok(Output {
                        stdout: (*stdout).to_owned(),
                        stderr: String::new(),
                    }),
                    Err(message) => Err(anyhow::anyhow!("{}", message)),
                };
            }
        }
        Ok(Output::default())
    }
}

fn fast_provision_config() -> Config {
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

fn fast_admin_config() -> AdminConfig {
    let mut config = AdminConfig::new(KEY);
    config.health_poll = PollSettings::new(Duration::from_millis(100), Duration::from_millis(1));
    config
}

fn admin(
    directory: Arc<InMemoryDirectory>,
    runner: Arc<ScriptedRunner>,
) -> Administrator<NodeProvisioner<InMemoryDirectory>> {
    let provisioner = NodeProvisioner::new(directory, runner.clone(), fast_provision_config());
    Administrator::new(provisioner, runner, "1.32", fast_admin_config()).unwrap()
}

fn workers() -> BTreeSet<NodeRole> {
    [NodeRole::Worker].into_iter().collect()
}

fn control_planes() -> BTreeSet<NodeRole> {
    [NodeRole::ControlPlane].into_iter().collect()
}

#[tokio::test]
async fn unsupported_version_fails_before_any_call() {
    let directory = Arc::new(InMemoryDirectory::new());
    let runner = Arc::new(ScriptedRunner::new());
    let provisioner =
        NodeProvisioner::new(directory, runner.clone(), fast_provision_config());
    let err = Administrator::new(provisioner, runner.clone(), "1.30", fast_admin_config())
        .err()
        .unwrap();
    assert!(matches!(err, AdminError::UnsupportedVersion { .. }));
    assert!(!runner.ran("kubeadm").await);
}

#[tokio::test]
async fn init_bootstraps_an_endpoint_control_plane() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new());
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();

    let nodes = admin.nodes(&cluster_id).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert!(nodes[0].is_control_plane());
    assert!(nodes[0].endpoint);

    assert!(runner.ran("kubeadm init --config").await);
    assert!(runner.ran("kube-flannel").await);
    let init = runner.first_matching("kubeadm init").await.unwrap();
    assert!(init.contains(&format!("--node-name {}", nodes[0].name)));
}

#[tokio::test]
async fn add_node_joins_through_the_coordinator() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(2, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().on("token create", JOIN_COMMAND));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let node = admin.add_node(&cluster_id, workers()).await.unwrap();

    let join = runner.first_matching("kubeadm join").await.unwrap();
    assert!(join.starts_with(JOIN_COMMAND));
    assert!(join.contains(&format!("--node-name {}", node.name)));
    assert!(!join.contains("--control-plane"));
    assert!(
        runner
            .ran(&format!(
                "label node {} node-role.kubernetes.io/worker=",
                node.name
            ))
            .await
    );
    assert_eq!(admin.nodes(&cluster_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn control_plane_joins_carry_a_certificate_key() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(2, PRODUCT, IMAGE).await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .on("token create", JOIN_COMMAND)
            .on("upload-certs", "d00d1e5"),
    );
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    admin.add_node(&cluster_id, control_planes()).await.unwrap();

    let join = runner.first_matching("kubeadm join").await.unwrap();
    assert!(join.contains("--control-plane --certificate-key d00d1e5"));
}

#[tokio::test]
async fn empty_join_command_is_rejected() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(2, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().on("token create", "  \n"));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let err = admin.add_node(&cluster_id, workers()).await.unwrap_err();
    assert!(matches!(err, AdminError::EmptyJoinCommand(_)));
    assert!(!runner.ran("kubeadm join").await);
}

#[tokio::test]
async fn removing_the_endpoint_is_refused_while_other_nodes_remain() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(2, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().on("token create", JOIN_COMMAND));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    admin.add_node(&cluster_id, workers()).await.unwrap();
    let endpoint = admin
        .nodes(&cluster_id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.endpoint)
        .unwrap();

    let err = admin.remove_node(&cluster_id, &endpoint.id).await.unwrap_err();
    assert!(matches!(err, AdminError::EndpointNode(_)));
    // Guards run before any mutation.
    assert!(!runner.ran("drain").await);
    assert_eq!(admin.nodes(&cluster_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn removing_the_last_control_plane_is_refused() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new());
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let only = admin.nodes(&cluster_id).await.unwrap().remove(0);

    let err = admin.remove_node(&cluster_id, &only.id).await.unwrap_err();
    assert!(matches!(err, AdminError::LastControlPlane(_)));
    assert!(!runner.ran("drain").await);
}

#[tokio::test]
async fn removed_workers_are_drained_and_returned_to_the_pool() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(2, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().on("token create", JOIN_COMMAND));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let worker = admin.add_node(&cluster_id, workers()).await.unwrap();

    admin.remove_node(&cluster_id, &worker.id).await.unwrap();

    assert!(runner.ran(&format!("drain {}", worker.name)).await);
    assert!(runner.ran(&format!("delete node {}", worker.name)).await);
    assert_eq!(admin.nodes(&cluster_id).await.unwrap().len(), 1);
    let instance = directory.snapshot(worker.instance_id).await.unwrap();
    assert_eq!(instance.display_name, "");
    assert_eq!(instance.status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn delete_cluster_tears_down_every_node() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(3, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().on("token create", JOIN_COMMAND));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    admin.add_node(&cluster_id, workers()).await.unwrap();
    admin.add_node(&cluster_id, workers()).await.unwrap();

    admin.delete_cluster(&cluster_id).await.unwrap();
    assert!(admin.nodes(&cluster_id).await.unwrap().is_empty());
    assert_eq!(directory.tag_count().await, 0);
}

#[tokio::test]
async fn etcd_health_counts_unhealthy_endpoints() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .on(
                "endpoint health",
                "https://10.0.0.1:2379 is healthy: took = 1ms\n\
                 https://10.0.0.2:2379 is healthy: took = 2ms\n\
                 https://10.0.0.3:2379 is unhealthy: context deadline exceeded",
            )
            .on(
                "member list",
                "8e9e05c52164694d, started, node-a, https://10.0.0.1:2380, https://10.0.0.1:2379, false",
            ),
    );
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let status = admin.check_etcd_health(&cluster_id).await.unwrap();
    assert!(!status.healthy);
    assert_eq!(status.healthy_endpoints, 2);
    assert_eq!(status.total_endpoints, 3);
    assert_eq!(status.members.len(), 1);
    assert!(!status.has_alarms);
}

#[tokio::test]
async fn an_active_alarm_makes_the_cluster_unhealthy() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .on("endpoint health", "https://10.0.0.1:2379 is healthy: took = 1ms")
            .on("alarm list", "memberID:8e9e05c52164694d alarm:NOSPACE"),
    );
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let status = admin.check_etcd_health(&cluster_id).await.unwrap();
    assert!(status.has_alarms);
    assert!(!status.healthy);
}

#[tokio::test]
async fn backup_succeeds_when_the_snapshot_verifies() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().on(
        "snapshot status",
        r#"{"hash":3787866103,"revision":12493,"totalKey":1516,"totalSize":3244032}"#,
    ));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let backup = admin.backup_etcd(&cluster_id).await.unwrap();
    assert!(backup.path.starts_with("/var/backups/etcd/etcd-"));
    assert_eq!(backup.total_size, 3_244_032);
    assert_eq!(backup.total_keys, 1516);
    assert!(runner.ran(&format!("snapshot save {}", backup.path)).await);
}

#[tokio::test]
async fn backup_rejects_a_zero_size_snapshot() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().on(
        "snapshot status",
        r#"{"hash":0,"revision":0,"totalKey":0,"totalSize":0}"#,
    ));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let err = admin.backup_etcd(&cluster_id).await.unwrap_err();
    assert!(matches!(err, AdminError::BackupVerificationFailed { .. }));
}

#[tokio::test]
async fn backup_rejects_garbled_verification_output() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(
        ScriptedRunner::new().on("snapshot status", "Error: snapshot file corrupted"),
    );
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let err = admin.backup_etcd(&cluster_id).await.unwrap_err();
    match err {
        AdminError::BackupVerificationFailed { reason, .. } => {
            assert!(reason.contains("unparseable"));
        }
        other => panic!("expected BackupVerificationFailed, got {}", other),
    }
}

#[tokio::test]
async fn upgrade_to_an_unknown_version_fails_before_the_backup() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new());
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let err = admin.upgrade_cluster(&cluster_id, "2.0").await.unwrap_err();
    assert!(matches!(err, AdminError::UnsupportedVersion { .. }));
    assert!(!runner.ran("snapshot save").await);
}

#[tokio::test]
async fn upgrade_runs_apply_on_the_endpoint_first() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .on(
                "snapshot status",
                r#"{"hash":1,"revision":1,"totalKey":10,"totalSize":2048}"#,
            )
            .on("endpoint health", "https://10.0.0.1:2379 is healthy: took = 1ms"),
    );
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    admin.upgrade_cluster(&cluster_id, "1.31").await.unwrap();

    assert!(runner.ran("kubeadm upgrade apply v1.31.8 --yes").await);
    assert!(runner.ran("kubeadm=1.31.8-1.1").await);
    assert!(runner.ran("systemctl restart kubelet").await);
}

#[tokio::test]
async fn restore_aborts_when_etcd_never_converges() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().on(
        "endpoint health",
        "https://10.0.0.1:2379 is unhealthy: context deadline exceeded",
    ));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    let err = admin
        .restore_etcd(&cluster_id, "/var/backups/etcd/etcd-old.db")
        .await
        .unwrap_err();
    match err {
        AdminError::EtcdUnhealthy { healthy, total } => {
            assert_eq!(healthy, 0);
            assert_eq!(total, 1);
        }
        other => panic!("expected EtcdUnhealthy, got {}", other),
    }
    assert!(runner.ran("etcdutl snapshot restore").await);
    assert!(runner.ran("systemctl start kubelet").await);
}

#[tokio::test]
async fn restore_converges_to_health() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().on(
        "endpoint health",
        "https://10.0.0.1:2379 is healthy: took = 1ms",
    ));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let cluster_id = admin.init_cluster(InitOptions::default()).await.unwrap();
    admin
        .restore_etcd(&cluster_id, "/var/backups/etcd/etcd-old.db")
        .await
        .unwrap();
    assert!(runner.ran("systemctl stop kubelet").await);
    assert!(runner.ran("mv /var/lib/etcd").await);
}

#[tokio::test]
async fn remote_failures_name_the_operation_and_node() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.seed_pool(1, PRODUCT, IMAGE).await;
    let runner = Arc::new(ScriptedRunner::new().fail_on("kubeadm init --config", "exit 1"));
    let admin = admin(Arc::clone(&directory), runner.clone());

    let err = admin.init_cluster(InitOptions::default()).await.unwrap_err();
    match err {
        AdminError::Remote { context, .. } => assert_eq!(context, "kubeadm init"),
        other => panic!("expected Remote, got {}", other),
    }
}
