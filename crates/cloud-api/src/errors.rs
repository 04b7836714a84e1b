//! Errors returned when interacting with the Instance Directory.

use serde::Deserialize;

/// An error from the Instance Directory or the transport underneath it.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory rejected the request.
    #[error("directory API error ({status}): {message}")]
    Api {
        /// HTTP status code reported by the provider.
        status: u16,
        /// The provider's human-readable message.
        message: String,
    },

    /// The requested resource does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Resource kind ("instance", "secret", "tag", ...).
        kind: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// The resource is locked by another in-flight provider operation.
    ///
    /// Transient. The client retries these internally with a bounded
    /// budget before surfacing the error.
    #[error("{kind} {id} is locked by another operation")]
    Locked {
        /// Resource kind.
        kind: &'static str,
        /// The identifier of the locked resource.
        id: String,
    },

    /// A write was rejected because another writer got there first.
    #[error("conflicting write on {kind} {id}")]
    Conflict {
        /// Resource kind.
        kind: &'static str,
        /// The identifier of the contended resource.
        id: String,
    },

    /// The response body could not be interpreted.
    #[error("invalid directory response: {0}")]
    InvalidResponse(String),

    /// The HTTP transport failed.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// The error envelope the provider wraps failures in.
#[derive(Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub(crate) message: String,
}
