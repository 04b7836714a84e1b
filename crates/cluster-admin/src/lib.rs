//! Kubernetes cluster administration on top of pooled nodes.
//!
//! The administrator drives a cluster through its lifecycle (bootstrap,
//! join, drain, remove, upgrade) by executing kubeadm and kubectl over SSH
//! on nodes supplied by a [`provisioner::Provision`] implementation. It
//! holds no state of its own: cluster membership is reconstructed from the
//! instance pool on every operation. Version-specific install and upgrade
//! steps come from a [`versions::VersionStrategy`] resolved once at
//! construction; unsupported versions fail fast.
//!
//! Etcd maintenance (health checks, verified snapshots, coordinated
//! restore) lives here too, since it is control-plane surgery rather than
//! node lifecycle.

#![warn(missing_docs)]

pub mod bootstrap;
pub mod etcd;
pub mod versions;

mod admin;
mod errors;

pub use admin::{Administrator, AdminConfig, InitOptions};
pub use bootstrap::Cni;
pub use errors::AdminError;
pub use etcd::{EtcdBackup, EtcdHealthStatus, EtcdMember};
