use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading configuration or talking to the cluster
#[derive(Error, Debug)]
pub enum Error {
    /// Error during JSON serialization/deserialization
    #[error("SerializationError: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from the Kubernetes client
    #[error("Kube Error: {0}")]
    Kube(#[from] kube::Error),

    /// The configuration document could not be parsed
    #[error("ConfigParseError: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// The configuration parsed but is not usable
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A selector string does not conform to the selector grammar
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },

    /// A file referenced by the configuration could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The existing-object pass could not list any of the configured kinds
    #[error("not authorized to enumerate any of the configured target kinds")]
    ExistingUnauthorized,

    /// The shutdown signal handler could not be installed
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

impl Error {
    pub(crate) fn selector(selector: &str, reason: impl Into<String>) -> Self {
        Self::Selector {
            selector: selector.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Result type for kube-marker operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
