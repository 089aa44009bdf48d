//! Error types for the Pachyderm backup operator and backup handler

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator and backup handler error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Record or resource absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// A job with the same id already exists
    #[error("Duplicate job id: {0}")]
    DuplicateId(String),

    /// Job store could not be reached or failed the query
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] sqlx::Error),

    /// Cluster or coordination API unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote command exited unsuccessfully
    #[error("Remote execution failed: {message}")]
    RemoteExecution { message: String, stderr: String },

    /// Destination workload still has replicas
    #[error("Pods still running: {0}")]
    PodsStillRunning(String),

    /// Coordination API answered with an unexpected status
    #[error("Coordination API returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Stored or transmitted payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("record not found".to_string()),
            other => Error::StorageUnavailable(other),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::Decode(err.to_string())
        } else {
            Error::Connection(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Decode(format!("invalid base64 payload: {}", err))
    }
}
