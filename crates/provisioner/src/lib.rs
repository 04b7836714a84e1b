//! Node provisioning on top of a reusable pool of cloud instances.
//!
//! The pool has no server-side locking: the only coordination channel is
//! each instance's mutable display name. This crate owns the protocol that
//! turns an anonymous pooled instance into a verified, cluster-bound
//! [`Node`]: claim the instance by writing an ownership label into its
//! display name (and reading it back to detect racing claimants), reinstall
//! it when the image or SSH keys are wrong, register it in the cluster's
//! tag index, then verify it answers ping, SSH and can reach its peers.
//! Verification failures release the instance back to the pool and the
//! whole sequence is retried against a different candidate.
//!
//! The [`Provision`] trait is the seam the cluster administrator consumes;
//! [`NodeProvisioner`] is the production implementation.

#![warn(missing_docs)]

pub mod config;
pub mod label;
pub mod poll;
pub mod ssh;

mod claim;
mod errors;
mod node;
mod provisioner;
mod verify;

pub use config::Config;
pub use errors::ProvisionError;
pub use node::{Node, NodeRole};
pub use provisioner::{NodeProvisioner, Provision, ProvisionRequest};
pub use verify::{CheckKind, VerificationError};
