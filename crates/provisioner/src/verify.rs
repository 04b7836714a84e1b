//! Post-claim verification of a freshly provisioned node.
//!
//! Three checks, each with its own retry budget: the instance answers ICMP
//! from where the provisioner runs, it accepts an SSH command, and it can
//! reach every already-provisioned peer (over the private network too, when
//! one is attached). A failure names the exact check, node, peer and
//! command involved so operators can tell a dead machine from a broken
//! network fabric.

use std::fmt;

use tracing::debug;

use crate::config::Config;
use crate::node::Node;
use crate::poll::poll_until;
use crate::ssh::{CommandRunner, SshOptions};

/// Which verification check failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckKind {
    /// The node never answered ICMP from the public internet.
    Ping,
    /// The node never accepted an SSH command.
    Ssh,
    /// The node could not reach a peer's public address.
    PeerPublic,
    /// The node could not reach a peer's private address.
    PeerPrivate,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Ping => write!(f, "ping"),
            CheckKind::Ssh => write!(f, "ssh"),
            CheckKind::PeerPublic => write!(f, "peer-public"),
            CheckKind::PeerPrivate => write!(f, "peer-private"),
        }
    }
}

/// A verification check failed for a specific node.
#[derive(Debug)]
pub struct VerificationError {
    /// The check that failed.
    pub check: CheckKind,
    /// Id of the node under verification.
    pub node: String,
    /// Id of the peer involved, for reachability checks.
    pub peer: Option<String>,
    /// The command that was attempted.
    pub command: String,
    /// The underlying failure.
    pub source: anyhow::Error,
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} check failed on node {}", self.check, self.node)?;
        if let Some(peer) = &self.peer {
            write!(f, " (peer {})", peer)?;
        }
        write!(f, ": `{}`", self.command)
    }
}

impl std::error::Error for VerificationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

fn ping_command(ip: std::net::IpAddr) -> String {
    format!("ping -c 1 -W 2 {}", ip)
}

/// Runs the full check sequence against `node`.
pub(crate) async fn verify_node<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &Config,
    node: &Node,
    peers: &[Node],
) -> Result<(), VerificationError> {
    check_ping(runner, config, node).await?;
    check_ssh(runner, config, node).await?;
    for peer in peers {
        check_peer(runner, config, node, peer).await?;
    }
    Ok(())
}

async fn check_ping<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &Config,
    node: &Node,
) -> Result<(), VerificationError> {
    let command = ping_command(node.public_ip);
    debug!(node = %node.id, %command, "verifying ICMP reachability");
    let result = poll_until("ICMP answer", &config.ping_poll, || async {
        match runner.exec(&command).await {
            Ok(_) => Ok(Some(())),
            Err(e) => Err(e),
        }
    })
    .await;
    result.map_err(|e| {
        let timeout = format!("timed out after {:?} waiting for {}", e.timeout, e.what);
        VerificationError {
            check: CheckKind::Ping,
            node: node.id.clone(),
            peer: None,
            command: command.clone(),
            source: match e.last_error {
                Some(last) => last.context(timeout),
                None => anyhow::anyhow!(timeout),
            },
        }
    })
}

async fn check_ssh<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &Config,
    node: &Node,
) -> Result<(), VerificationError> {
    let command = "true";
    debug!(node = %node.id, "verifying SSH access");
    runner
        .ssh(node.public_ip, command, &config.check_ssh)
        .await
        .map(|_| ())
        .map_err(|e| VerificationError {
            check: CheckKind::Ssh,
            node: node.id.clone(),
            peer: None,
            command: command.to_owned(),
            source: e,
        })
}

async fn check_peer<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &Config,
    node: &Node,
    peer: &Node,
) -> Result<(), VerificationError> {
    let command = ping_command(peer.public_ip);
    debug!(node = %node.id, peer = %peer.id, "verifying peer reachability");
    runner
        .ssh(node.public_ip, &command, &config.check_ssh)
        .await
        .map_err(|e| VerificationError {
            check: CheckKind::PeerPublic,
            node: node.id.clone(),
            peer: Some(peer.id.clone()),
            command: command.clone(),
            source: e,
        })?;

    if config.private_networking {
        if let Some(private_ip) = peer.private_ip {
            let command = ping_command(private_ip);
            runner
                .ssh(node.public_ip, &command, &config.check_ssh)
                .await
                .map_err(|e| VerificationError {
                    check: CheckKind::PeerPrivate,
                    node: node.id.clone(),
                    peer: Some(peer.id.clone()),
                    command: command.clone(),
                    source: e,
                })?;
        }
    }
    Ok(())
}
