//! Version-specific install and upgrade steps.
//!
//! One [`VersionStrategy`] per supported Kubernetes minor version, resolved
//! once at administrator construction from the version tag ("1.32") and
//! held for the administrator's lifetime. Everything a strategy produces is
//! a shell command executed over SSH; the strategies differ only in the
//! versions they pin.

use crate::errors::AdminError;

/// Version tags a strategy exists for.
pub const SUPPORTED: &[&str] = &["1.31", "1.32"];

/// Supplies the version-specific pieces of cluster administration.
pub trait VersionStrategy: Send + Sync {
    /// The minor version tag, e.g. `1.32`.
    fn version(&self) -> &'static str;

    /// The full version handed to kubeadm, e.g. `v1.32.4`.
    fn kubernetes_version(&self) -> &'static str;

    /// The distribution package version pin, e.g. `1.32.4-1.1`.
    fn package_version(&self) -> &'static str;

    /// Shell script installing the container runtime, kubeadm, kubelet and
    /// kubectl, pinned to this strategy's versions.
    fn install_script(&self) -> String {
        format!(
            r#"set -e
export DEBIAN_FRONTEND=noninteractive
apt-get update -q
apt-get install -qy containerd apt-transport-https ca-certificates curl gpg
mkdir -p /etc/apt/keyrings
curl -fsSL https://pkgs.k8s.io/core:/stable:/v{minor}/deb/Release.key \
  | gpg --yes --dearmor -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/v{minor}/deb/ /' \
  > /etc/apt/sources.list.d/kubernetes.list
apt-get update -q
apt-get install -qy --allow-change-held-packages \
  kubeadm={package} kubelet={package} kubectl={package}
apt-mark hold kubeadm kubelet kubectl
systemctl enable --now containerd kubelet
"#,
            minor = self.version(),
            package = self.package_version(),
        )
    }

    /// The upgrade command run on the first control-plane node.
    fn upgrade_apply_command(&self) -> String {
        format!("kubeadm upgrade apply {} --yes", self.kubernetes_version())
    }

    /// The upgrade command run on every other control-plane node.
    fn upgrade_node_command(&self) -> String {
        "kubeadm upgrade node".to_owned()
    }
}

struct V1_31;

impl VersionStrategy for V1_31 {
    fn version(&self) -> &'static str {
        "1.31"
    }

    fn kubernetes_version(&self) -> &'static str {
        "v1.31.8"
    }

    fn package_version(&self) -> &'static str {
        "1.31.8-1.1"
    }
}

struct V1_32;

impl VersionStrategy for V1_32 {
    fn version(&self) -> &'static str {
        "1.32"
    }

    fn kubernetes_version(&self) -> &'static str {
        "v1.32.4"
    }

    fn package_version(&self) -> &'static str {
        "1.32.4-1.1"
    }
}

/// Resolves a version tag to its strategy.
pub fn resolve(tag: &str) -> Result<Box<dyn VersionStrategy>, AdminError> {
    match tag {
        "1.31" => Ok(Box::new(V1_31)),
        "1.32" => Ok(Box::new(V1_32)),
        other => Err(AdminError::UnsupportedVersion {
            version: other.to_owned(),
            supported: SUPPORTED.join(", "),
        }),
    }
}
