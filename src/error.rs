//! Error types for the vpa-butler operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error surfaced by the client
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid startup configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A resource quantity string could not be parsed
    #[error("failed to parse quantity: {0}")]
    QuantityError(String),

    /// A node selector term could not be evaluated
    #[error("invalid node selector: {0}")]
    NodeSelectorError(String),

    /// The target of a VPA is unusable (missing fields, vanished object)
    #[error("invalid vpa target: {0}")]
    TargetError(String),

    /// The served VPA exists but is being torn down; retry later
    #[error("resource {0} already exists but is marked for deletion")]
    MarkedForDeletion(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error from the serving surfaces
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Whether a shorter requeue interval is warranted. Apiserver hiccups and
    /// deletion races resolve on their own; configuration and target problems
    /// need an external change first.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::MarkedForDeletion(_) | Error::IoError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
