//! An in-memory [`InstanceDirectory`].
//!
//! Backs the test suites and local dry runs. Provider convergence is
//! collapsed: create/reinstall/start leave the instance `Running`
//! immediately, so poll loops terminate on their first read. Display-name
//! writes are last-writer-wins, exactly like the real directory, which is
//! what the claim protocol's read-back check exercises.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::directory::{InstanceDirectory, Page};
use crate::errors::DirectoryError;
use crate::instance::{AddOn, CreateInstanceRequest, Instance, InstanceStatus, ReinstallRequest};
use crate::network::PrivateNetwork;
use crate::secret::{CreateSecretRequest, Secret};
use crate::tag::{Tag, TagAssignment};

#[derive(Default)]
struct State {
    instances: BTreeMap<i64, Instance>,
    secrets: BTreeMap<i64, Secret>,
    networks: BTreeMap<i64, PrivateNetwork>,
    tags: BTreeMap<i64, Tag>,
    assignments: Vec<TagAssignment>,
    next_id: i64,
}

impl State {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// An in-memory Instance Directory.
pub struct InMemoryDirectory {
    state: Mutex<State>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn page_of<T: Clone>(items: &[T], page: u32, size: u32) -> Page<T> {
    let start = ((page.max(1) - 1) as usize).saturating_mul(size as usize);
    let items = items
        .iter()
        .skip(start)
        .take(size as usize)
        .cloned()
        .collect();
    Page { items, page, size }
}

// Deterministic fake addressing: instance N gets 192.0.2-ish space carved
// from its id so tests can predict addresses.
fn public_ip_for(id: i64) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(198, 51, (id / 250) as u8, (id % 250) as u8 + 1))
}

fn private_ip_for(id: i64) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, (id / 250) as u8, (id % 250) as u8 + 1))
}

impl InMemoryDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Seeds the pool with `count` unclaimed running instances of the given
    /// product and image. Returns their ids.
    pub async fn seed_pool(&self, count: usize, product_id: &str, image_id: &str) -> Vec<i64> {
        let mut state = self.state.lock().await;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = state.allocate_id();
            state.instances.insert(
                id,
                Instance {
                    instance_id: id,
                    display_name: String::new(),
                    status: InstanceStatus::Running,
                    product_id: product_id.to_owned(),
                    image_id: image_id.to_owned(),
                    region: "EU".to_owned(),
                    add_ons: vec![AddOn::PrivateNetworking],
                    ssh_keys: Vec::new(),
                    ipv4: Some(public_ip_for(id)),
                    private_ipv4: None,
                    cancel_date: None,
                    error_message: None,
                },
            );
            ids.push(id);
        }
        ids
    }

    /// Returns a snapshot of a single instance, for assertions.
    pub async fn snapshot(&self, instance_id: i64) -> Option<Instance> {
        self.state.lock().await.instances.get(&instance_id).cloned()
    }

    /// Number of tags currently stored, for assertions.
    pub async fn tag_count(&self) -> usize {
        self.state.lock().await.tags.len()
    }
}

#[async_trait]
impl InstanceDirectory for InMemoryDirectory {
    async fn list_instances(&self, page: u32, size: u32) -> Result<Page<Instance>, DirectoryError> {
        let state = self.state.lock().await;
        let all: Vec<Instance> = state.instances.values().cloned().collect();
        Ok(page_of(&all, page, size))
    }

    async fn get_instance(&self, instance_id: i64) -> Result<Instance, DirectoryError> {
        let state = self.state.lock().await;
        state
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or(DirectoryError::NotFound {
                kind: "instance",
                id: instance_id.to_string(),
            })
    }

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<Instance, DirectoryError> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        let instance = Instance {
            instance_id: id,
            display_name: request.display_name.clone(),
            status: InstanceStatus::Running,
            product_id: request.product_id.clone(),
            image_id: request.image_id.clone(),
            region: request.region.clone(),
            add_ons: request.add_ons.clone(),
            ssh_keys: request.ssh_keys.clone(),
            ipv4: Some(public_ip_for(id)),
            private_ipv4: None,
            cancel_date: None,
            error_message: None,
        };
        state.instances.insert(id, instance.clone());
        Ok(instance)
    }

    async fn reinstall_instance(
        &self,
        instance_id: i64,
        request: &ReinstallRequest,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        let instance =
            state
                .instances
                .get_mut(&instance_id)
                .ok_or(DirectoryError::NotFound {
                    kind: "instance",
                    id: instance_id.to_string(),
                })?;
        instance.image_id = request.image_id.clone();
        instance.ssh_keys = request.ssh_keys.clone();
        instance.status = InstanceStatus::Running;
        Ok(())
    }

    async fn start_instance(&self, instance_id: i64) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        let instance =
            state
                .instances
                .get_mut(&instance_id)
                .ok_or(DirectoryError::NotFound {
                    kind: "instance",
                    id: instance_id.to_string(),
                })?;
        instance.status = InstanceStatus::Running;
        Ok(())
    }

    async fn stop_instance(&self, instance_id: i64) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        let instance =
            state
                .instances
                .get_mut(&instance_id)
                .ok_or(DirectoryError::NotFound {
                    kind: "instance",
                    id: instance_id.to_string(),
                })?;
        instance.status = InstanceStatus::Stopped;
        Ok(())
    }

    async fn set_display_name(
        &self,
        instance_id: i64,
        display_name: &str,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        let instance =
            state
                .instances
                .get_mut(&instance_id)
                .ok_or(DirectoryError::NotFound {
                    kind: "instance",
                    id: instance_id.to_string(),
                })?;
        instance.display_name = display_name.to_owned();
        Ok(())
    }

    async fn list_secrets(&self, page: u32, size: u32) -> Result<Page<Secret>, DirectoryError> {
        let state = self.state.lock().await;
        let all: Vec<Secret> = state.secrets.values().cloned().collect();
        Ok(page_of(&all, page, size))
    }

    async fn create_secret(
        &self,
        request: &CreateSecretRequest,
    ) -> Result<Secret, DirectoryError> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        let secret = Secret {
            secret_id: id,
            name: request.name.clone(),
            secret_type: request.secret_type,
            value: request.value.clone(),
        };
        state.secrets.insert(id, secret.clone());
        Ok(secret)
    }

    async fn delete_secret(&self, secret_id: i64) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        state
            .secrets
            .remove(&secret_id)
            .map(|_| ())
            .ok_or(DirectoryError::NotFound {
                kind: "secret",
                id: secret_id.to_string(),
            })
    }

    async fn list_private_networks(
        &self,
        page: u32,
        size: u32,
    ) -> Result<Page<PrivateNetwork>, DirectoryError> {
        let state = self.state.lock().await;
        let all: Vec<PrivateNetwork> = state.networks.values().cloned().collect();
        Ok(page_of(&all, page, size))
    }

    async fn create_private_network(
        &self,
        name: &str,
    ) -> Result<PrivateNetwork, DirectoryError> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        let network = PrivateNetwork {
            network_id: id,
            name: name.to_owned(),
            cidr: Some("10.0.0.0/16".to_owned()),
            instance_ids: Vec::new(),
        };
        state.networks.insert(id, network.clone());
        Ok(network)
    }

    async fn delete_private_network(&self, network_id: i64) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        state
            .networks
            .remove(&network_id)
            .map(|_| ())
            .ok_or(DirectoryError::NotFound {
                kind: "private network",
                id: network_id.to_string(),
            })
    }

    async fn assign_private_network(
        &self,
        network_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        let network = state
            .networks
            .get_mut(&network_id)
            .ok_or(DirectoryError::NotFound {
                kind: "private network",
                id: network_id.to_string(),
            })?;
        if !network.instance_ids.contains(&instance_id) {
            network.instance_ids.push(instance_id);
        }
        if let Some(instance) = state.instances.get_mut(&instance_id) {
            instance.private_ipv4 = Some(private_ip_for(instance_id));
        }
        Ok(())
    }

    async fn unassign_private_network(
        &self,
        network_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        if let Some(network) = state.networks.get_mut(&network_id) {
            network.instance_ids.retain(|id| *id != instance_id);
        }
        if let Some(instance) = state.instances.get_mut(&instance_id) {
            instance.private_ipv4 = None;
        }
        Ok(())
    }

    async fn list_tags(&self, page: u32, size: u32) -> Result<Page<Tag>, DirectoryError> {
        let state = self.state.lock().await;
        let all: Vec<Tag> = state.tags.values().cloned().collect();
        Ok(page_of(&all, page, size))
    }

    async fn create_tag(&self, name: &str) -> Result<Tag, DirectoryError> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        let tag = Tag {
            tag_id: id,
            name: name.to_owned(),
        };
        state.tags.insert(id, tag.clone());
        Ok(tag)
    }

    async fn delete_tag(&self, tag_id: i64) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        state.assignments.retain(|a| a.tag_id != tag_id);
        state
            .tags
            .remove(&tag_id)
            .map(|_| ())
            .ok_or(DirectoryError::NotFound {
                kind: "tag",
                id: tag_id.to_string(),
            })
    }

    async fn list_tag_assignments(
        &self,
        tag_id: i64,
        page: u32,
        size: u32,
    ) -> Result<Page<TagAssignment>, DirectoryError> {
        let state = self.state.lock().await;
        let all: Vec<TagAssignment> = state
            .assignments
            .iter()
            .filter(|a| a.tag_id == tag_id)
            .cloned()
            .collect();
        Ok(page_of(&all, page, size))
    }

    async fn create_tag_assignment(
        &self,
        tag_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        if !state.tags.contains_key(&tag_id) {
            return Err(DirectoryError::NotFound {
                kind: "tag",
                id: tag_id.to_string(),
            });
        }
        let assignment = TagAssignment {
            tag_id,
            instance_id,
        };
        if !state.assignments.contains(&assignment) {
            state.assignments.push(assignment);
        }
        Ok(())
    }

    async fn delete_tag_assignment(
        &self,
        tag_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        state
            .assignments
            .retain(|a| !(a.tag_id == tag_id && a.instance_id == instance_id));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn seeded_instances_are_unclaimed_and_running() {
        let directory = InMemoryDirectory::new();
        let ids = directory.seed_pool(3, "V45", "ubuntu-22.04").await;
        assert_eq!(ids.len(), 3);
        let page = directory.list_instances(1, 10).await.unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.is_last());
        for instance in page.items {
            assert!(instance.display_name.is_empty());
            assert_eq!(instance.status, InstanceStatus::Running);
            assert!(instance.ipv4.is_some());
        }
    }

    #[tokio::test]
    async fn listing_pages_until_short_page() {
        let directory = InMemoryDirectory::new();
        directory.seed_pool(5, "V45", "ubuntu-22.04").await;
        let first = directory.list_instances(1, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(!first.is_last());
        let third = directory.list_instances(3, 2).await.unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.is_last());
    }

    #[tokio::test]
    async fn display_name_writes_are_last_writer_wins() {
        let directory = InMemoryDirectory::new();
        let ids = directory.seed_pool(1, "V45", "ubuntu-22.04").await;
        directory.set_display_name(ids[0], "cluster=a").await.unwrap();
        directory.set_display_name(ids[0], "cluster=b").await.unwrap();
        let instance = directory.get_instance(ids[0]).await.unwrap();
        assert_eq!(instance.display_name, "cluster=b");
    }

    #[tokio::test]
    async fn tag_assignment_is_idempotent() {
        let directory = InMemoryDirectory::new();
        let ids = directory.seed_pool(1, "V45", "ubuntu-22.04").await;
        let tag = directory.create_tag("cluster=a").await.unwrap();
        directory
            .create_tag_assignment(tag.tag_id, ids[0])
            .await
            .unwrap();
        directory
            .create_tag_assignment(tag.tag_id, ids[0])
            .await
            .unwrap();
        let assignments = directory
            .list_tag_assignments(tag.tag_id, 1, 10)
            .await
            .unwrap();
        assert_eq!(assignments.items.len(), 1);
        // Deleting twice is also a no-op.
        directory
            .delete_tag_assignment(tag.tag_id, ids[0])
            .await
            .unwrap();
        directory
            .delete_tag_assignment(tag.tag_id, ids[0])
            .await
            .unwrap();
    }
}
