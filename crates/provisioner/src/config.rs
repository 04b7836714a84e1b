//! Configuration for the node provisioner.

use std::time::Duration;

use crate::poll::PollSettings;
use crate::ssh::SshOptions;

/// How many times the whole claim-install-verify sequence is attempted
/// before provisioning fails loudly.
pub const DEFAULT_PROVISION_ATTEMPTS: u32 = 3;

const DEFAULT_PAGE_SIZE: u32 = 50;

/// Settings the provisioner needs to pick and prepare instances.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity class an instance must have to be a claim candidate, and
    /// the class used when auto-provisioning creates a fresh one.
    pub product_id: String,
    /// OS image nodes must run. Mismatched candidates get reinstalled.
    pub image_id: String,
    /// Region used when auto-provisioning creates a fresh instance.
    pub region: String,
    /// Page size for directory scans.
    pub page_size: u32,
    /// Whether to create a fresh instance when the pool has no unclaimed
    /// candidate. When disabled, an empty pool is a hard "no capacity"
    /// failure.
    pub auto_provision: bool,
    /// Attempts for the whole claim-install-verify sequence.
    pub provision_attempts: u32,
    /// Whether cluster nodes get attached to a per-cluster private network
    /// and verified over it.
    pub private_networking: bool,
    /// Whether cluster membership is additionally indexed with a
    /// `cluster=<id>` tag.
    pub use_tags: bool,
    /// Poll budget for instance status convergence (create, reinstall,
    /// start, stop, network attach).
    pub status_poll: PollSettings,
    /// Poll budget for the ICMP verification check.
    pub ping_poll: PollSettings,
    /// SSH options for the SSH and peer-reachability checks.
    pub check_ssh: SshOptions,
}

impl Config {
    /// Defaults for the given capacity class, image and region.
    pub fn new(
        product_id: impl Into<String>,
        image_id: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            image_id: image_id.into(),
            region: region.into(),
            page_size: DEFAULT_PAGE_SIZE,
            auto_provision: true,
            provision_attempts: DEFAULT_PROVISION_ATTEMPTS,
            private_networking: false,
            use_tags: true,
            status_poll: PollSettings::default(),
            ping_poll: PollSettings::new(Duration::from_secs(120), Duration::from_secs(5)),
            check_ssh: SshOptions::default(),
        }
    }
}
