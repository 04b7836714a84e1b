//! REST binding for the Instance Directory.
//!
//! The provider exposes a conventional JSON API: every response wraps its
//! payload in a `data` array, errors come back as `{ "message": ... }`, and
//! long-running operations (create, reinstall, start, stop) return
//! immediately while the instance status converges in the background.
//! Callers poll for convergence; this client only retries the transient
//! "resource is locked" responses the provider emits while an earlier
//! operation is still settling.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use url::Url;

use crate::directory::{InstanceDirectory, Page};
use crate::errors::{ApiErrorBody, DirectoryError};
use crate::instance::{CreateInstanceRequest, Instance, ReinstallRequest};
use crate::network::PrivateNetwork;
use crate::secret::{CreateSecretRequest, Secret};
use crate::tag::{Tag, TagAssignment};

/// Configuration for a [`DirectoryClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the provider API, e.g. `https://api.example.com/v1/`.
    pub base_url: Url,
    /// Bearer token used on every request.
    pub api_token: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// How many times a "resource locked" response is retried before it
    /// surfaces as [`DirectoryError::Locked`].
    pub locked_retries: u32,
    /// Delay between locked retries.
    pub locked_backoff: Duration,
}

impl ClientConfig {
    /// A config with the defaults the provider documents: 30 second
    /// requests, five locked retries two seconds apart.
    pub fn new(base_url: Url, api_token: String) -> Self {
        Self {
            base_url,
            api_token,
            timeout: Duration::from_secs(30),
            locked_retries: 5,
            locked_backoff: Duration::from_secs(2),
        }
    }
}

/// A reqwest-backed [`InstanceDirectory`].
pub struct DirectoryClient {
    config: ClientConfig,
    client: reqwest::Client,
}

/// Every provider response wraps its payload in a `data` array, even for
/// single-object endpoints.
#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

impl DirectoryClient {
    /// Creates a client from the given config.
    pub fn new(config: ClientConfig) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DirectoryError> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| DirectoryError::InvalidResponse(format!("bad endpoint {}: {}", path, e)))
    }

    fn builder(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.config.api_token)
    }

    /// Sends a request, retrying transient locked responses, and decodes
    /// the `data` envelope. `kind`/`id` only feed error construction.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        kind: &'static str,
        id: String,
    ) -> Result<Vec<T>, DirectoryError> {
        let url = self.endpoint(path)?;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut builder = self.builder(method.clone(), url.clone());
            if let Some(ref body) = body {
                builder = builder.json(body);
            }
            trace!(%url, %method, attempt, "directory request");
            let response = builder.send().await?;
            let status = response.status();

            if status.is_success() {
                if status == StatusCode::NO_CONTENT {
                    return Ok(Vec::new());
                }
                let envelope: Envelope<T> = response.json().await?;
                return Ok(envelope.data);
            }

            let message = response
                .json::<ApiErrorBody>()
                .await
                .map(|b| b.message)
                .unwrap_or_default();

            match status {
                StatusCode::NOT_FOUND => {
                    return Err(DirectoryError::NotFound { kind, id });
                }
                StatusCode::CONFLICT => {
                    return Err(DirectoryError::Conflict { kind, id });
                }
                StatusCode::LOCKED | StatusCode::TOO_MANY_REQUESTS => {
                    if attempt > self.config.locked_retries {
                        return Err(DirectoryError::Locked { kind, id });
                    }
                    debug!(
                        %url, attempt,
                        "directory reports {} {} locked, backing off", kind, id
                    );
                    tokio::time::sleep(self.config.locked_backoff).await;
                }
                _ => {
                    warn!(%url, status = status.as_u16(), %message, "directory request failed");
                    return Err(DirectoryError::Api {
                        status: status.as_u16(),
                        message,
                    });
                }
            }
        }
    }

    async fn send_one<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        kind: &'static str,
        id: String,
    ) -> Result<T, DirectoryError> {
        let mut items = self.send::<T>(method, path, body, kind, id.clone()).await?;
        match items.pop() {
            Some(item) if items.is_empty() => Ok(item),
            _ => Err(DirectoryError::InvalidResponse(format!(
                "expected exactly one {} for {}",
                kind, id
            ))),
        }
    }

    async fn send_page<T: DeserializeOwned>(
        &self,
        path: &str,
        page: u32,
        size: u32,
        kind: &'static str,
    ) -> Result<Page<T>, DirectoryError> {
        let path = format!("{}?page={}&size={}", path, page, size);
        let items = self
            .send::<T>(Method::GET, &path, None, kind, format!("page {}", page))
            .await?;
        Ok(Page { items, page, size })
    }

    fn json<B: Serialize>(body: &B) -> Result<serde_json::Value, DirectoryError> {
        serde_json::to_value(body)
            .map_err(|e| DirectoryError::InvalidResponse(format!("unserializable body: {}", e)))
    }
}

#[async_trait]
impl InstanceDirectory for DirectoryClient {
    async fn list_instances(&self, page: u32, size: u32) -> Result<Page<Instance>, DirectoryError> {
        self.send_page("compute/instances", page, size, "instance")
            .await
    }

    async fn get_instance(&self, instance_id: i64) -> Result<Instance, DirectoryError> {
        self.send_one(
            Method::GET,
            &format!("compute/instances/{}", instance_id),
            None,
            "instance",
            instance_id.to_string(),
        )
        .await
    }

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<Instance, DirectoryError> {
        self.send_one(
            Method::POST,
            "compute/instances",
            Some(Self::json(request)?),
            "instance",
            request.display_name.clone(),
        )
        .await
    }

    async fn reinstall_instance(
        &self,
        instance_id: i64,
        request: &ReinstallRequest,
    ) -> Result<(), DirectoryError> {
        self.send::<serde_json::Value>(
            Method::PUT,
            &format!("compute/instances/{}", instance_id),
            Some(Self::json(request)?),
            "instance",
            instance_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn start_instance(&self, instance_id: i64) -> Result<(), DirectoryError> {
        self.send::<serde_json::Value>(
            Method::POST,
            &format!("compute/instances/{}/actions/start", instance_id),
            None,
            "instance",
            instance_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn stop_instance(&self, instance_id: i64) -> Result<(), DirectoryError> {
        self.send::<serde_json::Value>(
            Method::POST,
            &format!("compute/instances/{}/actions/stop", instance_id),
            None,
            "instance",
            instance_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn set_display_name(
        &self,
        instance_id: i64,
        display_name: &str,
    ) -> Result<(), DirectoryError> {
        self.send::<serde_json::Value>(
            Method::PATCH,
            &format!("compute/instances/{}", instance_id),
            Some(serde_json::json!({ "displayName": display_name })),
            "instance",
            instance_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn list_secrets(&self, page: u32, size: u32) -> Result<Page<Secret>, DirectoryError> {
        self.send_page("secrets", page, size, "secret").await
    }

    async fn create_secret(
        &self,
        request: &CreateSecretRequest,
    ) -> Result<Secret, DirectoryError> {
        self.send_one(
            Method::POST,
            "secrets",
            Some(Self::json(request)?),
            "secret",
            request.name.clone(),
        )
        .await
    }

    async fn delete_secret(&self, secret_id: i64) -> Result<(), DirectoryError> {
        self.send::<serde_json::Value>(
            Method::DELETE,
            &format!("secrets/{}", secret_id),
            None,
            "secret",
            secret_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn list_private_networks(
        &self,
        page: u32,
        size: u32,
    ) -> Result<Page<PrivateNetwork>, DirectoryError> {
        self.send_page("private-networks", page, size, "private network")
            .await
    }

    async fn create_private_network(
        &self,
        name: &str,
    ) -> Result<PrivateNetwork, DirectoryError> {
        self.send_one(
            Method::POST,
            "private-networks",
            Some(serde_json::json!({ "name": name })),
            "private network",
            name.to_owned(),
        )
        .await
    }

    async fn delete_private_network(&self, network_id: i64) -> Result<(), DirectoryError> {
        self.send::<serde_json::Value>(
            Method::DELETE,
            &format!("private-networks/{}", network_id),
            None,
            "private network",
            network_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn assign_private_network(
        &self,
        network_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let result = self
            .send::<serde_json::Value>(
                Method::POST,
                &format!("private-networks/{}/instances/{}", network_id, instance_id),
                None,
                "private network",
                network_id.to_string(),
            )
            .await;
        // Re-attaching is a no-op, per the directory contract.
        match result {
            Ok(_) | Err(DirectoryError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn unassign_private_network(
        &self,
        network_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let result = self
            .send::<serde_json::Value>(
                Method::DELETE,
                &format!("private-networks/{}/instances/{}", network_id, instance_id),
                None,
                "private network",
                network_id.to_string(),
            )
            .await;
        match result {
            Ok(_) | Err(DirectoryError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_tags(&self, page: u32, size: u32) -> Result<Page<Tag>, DirectoryError> {
        self.send_page("tags", page, size, "tag").await
    }

    async fn create_tag(&self, name: &str) -> Result<Tag, DirectoryError> {
        self.send_one(
            Method::POST,
            "tags",
            Some(serde_json::json!({ "name": name })),
            "tag",
            name.to_owned(),
        )
        .await
    }

    async fn delete_tag(&self, tag_id: i64) -> Result<(), DirectoryError> {
        self.send::<serde_json::Value>(
            Method::DELETE,
            &format!("tags/{}", tag_id),
            None,
            "tag",
            tag_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn list_tag_assignments(
        &self,
        tag_id: i64,
        page: u32,
        size: u32,
    ) -> Result<Page<TagAssignment>, DirectoryError> {
        self.send_page(
            &format!("tags/{}/assignments", tag_id),
            page,
            size,
            "tag assignment",
        )
        .await
    }

    async fn create_tag_assignment(
        &self,
        tag_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let result = self
            .send::<serde_json::Value>(
                Method::POST,
                &format!("tags/{}/assignments/instance/{}", tag_id, instance_id),
                None,
                "tag assignment",
                format!("{}/{}", tag_id, instance_id),
            )
            .await;
        match result {
            Ok(_) | Err(DirectoryError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_tag_assignment(
        &self,
        tag_id: i64,
        instance_id: i64,
    ) -> Result<(), DirectoryError> {
        let result = self
            .send::<serde_json::Value>(
                Method::DELETE,
                &format!("tags/{}/assignments/instance/{}", tag_id, instance_id),
                None,
                "tag assignment",
                format!("{}/{}", tag_id, instance_id),
            )
            .await;
        match result {
            Ok(_) | Err(DirectoryError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn endpoint_joins_relative_paths() {
        let config = ClientConfig::new(
            Url::parse("https://api.example.com/v1/").unwrap(),
            "token".into(),
        );
        let client = DirectoryClient::new(config).unwrap();
        let url = client.endpoint("compute/instances/42").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/compute/instances/42"
        );
    }

    #[test]
    fn envelope_decodes_missing_data_as_empty() {
        let envelope: Envelope<Instance> = serde_json::from_str("{}").unwrap();
        assert!(envelope.data.is_empty());
    }
}
