//! Bindings for the cloud provider's Instance Directory.
//!
//! The directory is the source of truth for everything kubeforge knows about
//! a machine: compute instances, the SSH key secrets injected into them,
//! private networks and tags. This crate defines the wire types, the
//! [`InstanceDirectory`] trait consumed by the provisioner, a REST binding
//! ([`client::DirectoryClient`]) and an in-memory directory
//! ([`mem::InMemoryDirectory`]) used by the test suites.
//!
//! All listing operations are paginated. The directory never offers a
//! server-side lock; callers coordinate through instance display names.

#![deny(missing_docs)]

pub mod client;
pub mod errors;
pub mod mem;

mod directory;
mod instance;
mod network;
mod secret;
mod tag;

pub use client::{ClientConfig, DirectoryClient};
pub use directory::{InstanceDirectory, Page};
pub use mem::InMemoryDirectory;
pub use errors::DirectoryError;
pub use instance::{AddOn, CreateInstanceRequest, Instance, InstanceStatus, ReinstallRequest};
pub use network::PrivateNetwork;
pub use secret::{CreateSecretRequest, Secret, SecretType};
pub use tag::{Tag, TagAssignment};
