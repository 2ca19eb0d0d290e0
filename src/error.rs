//! Error types shared across the server.

use std::path::PathBuf;

/// Error raised while building the runtime configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one --domain is required")]
    NoDomains,

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("--certificate-path and --private-key-path must be given together")]
    IncompleteTls,

    #[error("could not read {path}: {source}")]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Error raised by the interaction storage contract.
///
/// The client-facing message of each variant is what the HTTP control plane
/// returns in its `{"error": ...}` body, so these stay short and free of
/// internal detail.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("correlation id already registered")]
    DuplicateId,

    #[error("could not parse public key")]
    InvalidPublicKey,

    #[error("could not encrypt data")]
    Crypto,

    #[error("could not get correlation id")]
    IdNotFound,

    #[error("invalid secret key")]
    WrongSecret,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised while binding or running a listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("could not bind {listener} on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{listener} listener failed: {source}")]
    Listener {
        listener: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("could not load TLS material: {0}")]
    Tls(String),
}
