//! Etcd diagnostics and snapshot handling.
//!
//! The parsers here consume etcdctl's line-oriented output. They never
//! fail: empty or garbled output decodes as "nothing healthy", because a
//! health probe that cannot be read is indistinguishable from an unhealthy
//! cluster and must be reported as such rather than thrown.

use serde::Deserialize;

/// The etcdctl invocation prefix used on control-plane nodes, wired to the
/// certificates kubeadm lays down.
pub(crate) const ETCDCTL: &str = "ETCDCTL_API=3 etcdctl \
    --endpoints=https://127.0.0.1:2379 \
    --cacert=/etc/kubernetes/pki/etcd/ca.crt \
    --cert=/etc/kubernetes/pki/etcd/server.crt \
    --key=/etc/kubernetes/pki/etcd/server.key";

/// One member from `etcdctl member list`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdMember {
    /// The member id.
    pub id: String,
    /// Lifecycle status, typically `started`.
    pub status: String,
    /// The member name (the node name on kubeadm clusters).
    pub name: String,
    /// Peer URLs.
    pub peer_urls: String,
    /// Client URLs.
    pub client_urls: String,
}

/// A point-in-time view of etcd health, computed fresh on every check and
/// never persisted.
#[derive(Clone, Debug)]
pub struct EtcdHealthStatus {
    /// True only when every probed endpoint is healthy and no alarm is set.
    pub healthy: bool,
    /// Endpoints that answered the health probe.
    pub healthy_endpoints: usize,
    /// Endpoints probed in total.
    pub total_endpoints: usize,
    /// The member list, as far as it could be parsed.
    pub members: Vec<EtcdMember>,
    /// Whether any alarm (NOSPACE, CORRUPT, ...) is active.
    pub has_alarms: bool,
    /// The raw command outputs, for operators who need to look closer.
    pub raw_outputs: Vec<String>,
}

/// A verified etcd snapshot on a control-plane node.
#[derive(Clone, Debug)]
pub struct EtcdBackup {
    /// The node holding the snapshot.
    pub node_id: String,
    /// Absolute path of the snapshot file.
    pub path: String,
    /// Snapshot size in bytes, as reported by the integrity check.
    pub total_size: u64,
    /// Number of keys in the snapshot.
    pub total_keys: u64,
}

/// What `etcdutl snapshot status --write-out=json` reports.
#[derive(Debug, Deserialize)]
pub(crate) struct SnapshotStatus {
    #[serde(default, rename = "totalKey")]
    pub(crate) total_key: u64,
    #[serde(default, rename = "totalSize")]
    pub(crate) total_size: u64,
}

/// Counts `(healthy, total)` endpoints in `etcdctl endpoint health` output.
///
/// Example line: `https://127.0.0.1:2379 is healthy: successfully committed
/// proposal: took = 1.83ms`.
pub(crate) fn parse_endpoint_health(output: &str) -> (usize, usize) {
    let mut healthy = 0;
    let mut total = 0;
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        total += 1;
        if line.contains("is healthy") {
            healthy += 1;
        }
    }
    (healthy, total)
}

/// Parses `etcdctl member list` output. Lines that do not look like member
/// rows are skipped.
///
/// Example line: `8e9e05c52164694d, started, node-ab12,
/// https://10.0.0.3:2380, https://10.0.0.3:2379, false`.
pub(crate) fn parse_member_list(output: &str) -> Vec<EtcdMember> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 5 {
                return None;
            }
            Some(EtcdMember {
                id: fields[0].to_owned(),
                status: fields[1].to_owned(),
                name: fields[2].to_owned(),
                peer_urls: fields[3].to_owned(),
                client_urls: fields[4].to_owned(),
            })
        })
        .collect()
}

/// Whether `etcdctl alarm list` reports any active alarm. Any non-empty
/// line counts; healthy clusters print nothing.
pub(crate) fn parse_alarm_list(output: &str) -> bool {
    output.lines().any(|line| !line.trim().is_empty())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn two_of_three_healthy_endpoints() {
        let output = "\
https://10.0.0.1:2379 is healthy: successfully committed proposal: took = 1.2ms
https://10.0.0.2:2379 is healthy: successfully committed proposal: took = 2.1ms
https://10.0.0.3:2379 is unhealthy: failed to commit proposal: context deadline exceeded";
        assert_eq!(parse_endpoint_health(output), (2, 3));
    }

    #[test]
    fn garbled_health_output_counts_nothing_healthy() {
        assert_eq!(parse_endpoint_health(""), (0, 0));
        assert_eq!(parse_endpoint_health("\n\n"), (0, 0));
        let (healthy, total) = parse_endpoint_health("connection refused");
        assert_eq!(healthy, 0);
        assert_eq!(total, 1);
    }

    #[test]
    fn member_list_rows_parse() {
        let output = "\
8e9e05c52164694d, started, node-ab12, https://10.0.0.3:2380, https://10.0.0.3:2379, false
91bc3c398fb3c146, started, node-cd34, https://10.0.0.4:2380, https://10.0.0.4:2379, false";
        let members = parse_member_list(output);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "node-ab12");
        assert_eq!(members[1].status, "started");
        assert_eq!(members[1].client_urls, "https://10.0.0.4:2379");
    }

    #[test]
    fn member_list_skips_garbage() {
        assert!(parse_member_list("Error: context deadline exceeded").is_empty());
        assert!(parse_member_list("").is_empty());
    }

    #[test]
    fn alarm_lines_are_detected() {
        assert!(!parse_alarm_list(""));
        assert!(!parse_alarm_list("\n  \n"));
        assert!(parse_alarm_list("memberID:8e9e05c52164694d alarm:NOSPACE"));
    }

    #[test]
    fn snapshot_status_decodes() {
        let status: SnapshotStatus = serde_json::from_str(
            r#"{"hash":3787866103,"revision":12493,"totalKey":1516,"totalSize":3244032}"#,
        )
        .unwrap();
        assert_eq!(status.total_size, 3_244_032);
        assert_eq!(status.total_key, 1516);
    }
}
