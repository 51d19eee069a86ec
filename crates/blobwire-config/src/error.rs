//! Error types for configuration operations.

use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Spawning `git config` failed.
    #[error("failed to run git config")]
    GitSpawn {
        /// Operation that attempted to run git.
        operation: &'static str,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// `git config` exited with a failure status.
    #[error("git config exited unsuccessfully")]
    GitStatus {
        /// Operation that attempted to run git.
        operation: &'static str,
        /// Exit code when the process was not killed by a signal.
        code: Option<i32>,
        /// Trimmed standard error output.
        stderr: String,
    },
    /// `git config` printed output that was not valid UTF-8.
    #[error("git config output was not valid utf-8")]
    GitOutputUtf8 {
        /// Underlying UTF-8 conversion error.
        #[source]
        source: FromUtf8Error,
    },
    /// A configuration value could not be interpreted.
    #[error("invalid configuration value")]
    InvalidValue {
        /// Configuration key holding the value.
        key: String,
        /// Offending value.
        value: String,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// The in-memory writer state was poisoned by a panicking writer.
    #[error("configuration writer state poisoned")]
    WriterPoisoned,
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn config_error_messages_are_constant() {
        let err = ConfigError::GitSpawn {
            operation: "config.list",
            source: io::Error::other("missing"),
        };
        assert_eq!(err.to_string(), "failed to run git config");
        assert!(err.source().is_some());

        let err = ConfigError::InvalidValue {
            key: "http.version".to_string(),
            value: "HTTP/3".to_string(),
            reason: "unsupported http version",
        };
        assert_eq!(err.to_string(), "invalid configuration value");
        assert!(err.source().is_none());
    }
}
