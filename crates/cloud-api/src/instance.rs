use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A compute instance as reported by the Instance Directory.
///
/// The `display_name` is the only field kubeforge mutates on a pooled
/// instance and doubles as the distributed ownership channel: an empty name
/// marks the instance as unclaimed, a name carrying `cluster=<id>` marks it
/// as owned by that cluster, and a name carrying `error=<reason>` marks a
/// machine that failed verification and needs operator attention.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Stable numeric identity assigned by the provider.
    pub instance_id: i64,
    /// The mutable label used as the ownership channel.
    #[serde(default)]
    pub display_name: String,
    /// Provider-reported lifecycle status.
    pub status: InstanceStatus,
    /// Capacity class of the machine.
    pub product_id: String,
    /// OS image currently installed.
    pub image_id: String,
    /// Provider region the machine lives in.
    pub region: String,
    /// Feature add-ons enabled on the instance.
    #[serde(default)]
    pub add_ons: Vec<AddOn>,
    /// Ids of the SSH key secrets injected at install time.
    #[serde(default)]
    pub ssh_keys: Vec<i64>,
    /// Public IPv4 address, once assigned.
    #[serde(default)]
    pub ipv4: Option<IpAddr>,
    /// Private IPv4 address, present when private networking is attached.
    #[serde(default)]
    pub private_ipv4: Option<IpAddr>,
    /// Set when the instance is scheduled for cancellation at the provider.
    #[serde(default)]
    pub cancel_date: Option<String>,
    /// Set when the provider put the instance into an error state.
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Instance {
    /// Whether the provider considers this instance usable at all.
    ///
    /// Cancelled or errored machines are never claim candidates.
    pub fn is_intact(&self) -> bool {
        self.cancel_date.is_none()
            && self.error_message.is_none()
            && self.status != InstanceStatus::Error
    }
}

/// Provider-side lifecycle status of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// The provider is still allocating the machine.
    Provisioning,
    /// An image (re)install is in progress.
    Installing,
    /// The machine is up.
    Running,
    /// The machine is powered off.
    Stopped,
    /// The provider reports the machine as broken.
    Error,
    /// Any status this crate does not model.
    #[serde(other)]
    Unknown,
}

/// Feature add-ons that can be attached to an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddOn {
    /// The instance participates in provider private networking.
    PrivateNetworking,
    /// Any add-on this crate does not model.
    #[serde(other)]
    Other,
}

/// Request body for creating a fresh instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    /// Capacity class to allocate.
    pub product_id: String,
    /// OS image to install.
    pub image_id: String,
    /// Region to allocate in.
    pub region: String,
    /// SSH key secret ids to inject.
    #[serde(default)]
    pub ssh_keys: Vec<i64>,
    /// Initial display name. Callers claiming at creation time set the
    /// ownership label here so the instance never appears unclaimed.
    #[serde(default)]
    pub display_name: String,
    /// Add-ons to enable.
    #[serde(default)]
    pub add_ons: Vec<AddOn>,
}

/// Request body for reinstalling an existing instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReinstallRequest {
    /// OS image to install.
    pub image_id: String,
    /// SSH key secret ids to inject.
    #[serde(default)]
    pub ssh_keys: Vec<i64>,
}
