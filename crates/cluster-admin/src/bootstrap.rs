//! Rendering of the kubeadm bootstrap configuration and the pod network
//! manifests applied after init.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Where etcd keeps its data on control-plane nodes. The restore procedure
/// swaps this directory out, so everything etcd-related agrees on it.
pub const ETCD_DATA_DIR: &str = "/var/lib/etcd";

const CERTIFICATES_DIR: &str = "/etc/kubernetes/pki";

// 8 GiB, the etcd upstream recommendation for the backend quota.
const ETCD_QUOTA_BACKEND_BYTES: &str = "8589934592";

/// The supported pod network fabrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cni {
    /// Flannel VXLAN overlay.
    Flannel,
    /// Calico.
    Calico,
}

impl Cni {
    /// The manifest applied through the cluster's own API after init.
    pub fn manifest_url(&self) -> &'static str {
        match self {
            Cni::Flannel => {
                "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml"
            }
            Cni::Calico => {
                "https://raw.githubusercontent.com/projectcalico/calico/v3.29.3/manifests/calico.yaml"
            }
        }
    }
}

impl fmt::Display for Cni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cni::Flannel => write!(f, "flannel"),
            Cni::Calico => write!(f, "calico"),
        }
    }
}

impl FromStr for Cni {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flannel" => Ok(Cni::Flannel),
            "calico" => Ok(Cni::Calico),
            other => Err(format!("unknown pod network fabric: {}", other)),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration<'a> {
    api_version: &'static str,
    kind: &'static str,
    kubernetes_version: &'a str,
    networking: Networking<'a>,
    etcd: Etcd,
    certificates_dir: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Networking<'a> {
    pod_subnet: &'a str,
    service_subnet: &'a str,
}

#[derive(Serialize)]
struct Etcd {
    local: LocalEtcd,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalEtcd {
    data_dir: &'static str,
    extra_args: BTreeMap<&'static str, &'static str>,
}

/// Renders the kubeadm `ClusterConfiguration` document for `kubeadm init`.
pub fn render_init_config(
    kubernetes_version: &str,
    pod_cidr: &str,
    service_cidr: &str,
) -> Result<String, serde_yaml::Error> {
    let mut extra_args = BTreeMap::new();
    extra_args.insert("quota-backend-bytes", ETCD_QUOTA_BACKEND_BYTES);
    serde_yaml::to_string(&ClusterConfiguration {
        api_version: "kubeadm.k8s.io/v1beta3",
        kind: "ClusterConfiguration",
        kubernetes_version,
        networking: Networking {
            pod_subnet: pod_cidr,
            service_subnet: service_cidr,
        },
        etcd: Etcd {
            local: LocalEtcd {
                data_dir: ETCD_DATA_DIR,
                extra_args,
            },
        },
        certificates_dir: CERTIFICATES_DIR,
    })
}
