//! Error types for endpoint resolution.

use blobwire_config::ConfigError;
use thiserror::Error;

/// Errors raised while validating remotes or persisting access modes.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The remote is neither a configured remote nor a plausible URL.
    #[error("invalid remote name")]
    InvalidRemote {
        /// Remote name as supplied.
        remote: String,
    },
    /// The remote URL uses a protocol git cannot fetch from.
    #[error("invalid remote URL protocol")]
    InvalidRemoteProtocol {
        /// Scheme found in the URL.
        scheme: String,
        /// Remote URL as supplied.
        remote: String,
    },
    /// Persisting an access mode override failed.
    #[error("failed to persist access mode")]
    PersistAccess {
        /// Configuration key being written.
        key: String,
        /// Underlying configuration error.
        #[source]
        source: ConfigError,
    },
}

/// Convenience alias for endpoint results.
pub type EndpointResult<T> = Result<T, EndpointError>;
