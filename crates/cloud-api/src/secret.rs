use serde::{Deserialize, Serialize};

/// A secret stored at the provider, typically an SSH public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// Stable numeric identity assigned by the provider.
    pub secret_id: i64,
    /// Human-chosen name.
    pub name: String,
    /// What kind of secret this is.
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    /// The secret material. For SSH keys this is the public key line.
    pub value: String,
}

/// The kinds of secret the provider stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretType {
    /// An SSH public key injectable into instances.
    Ssh,
    /// A password secret.
    Password,
}

/// Request body for creating a secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecretRequest {
    /// Human-chosen name.
    pub name: String,
    /// What kind of secret to create.
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    /// The secret material.
    pub value: String,
}
