//! Error types for authenticated API requests.

use blobwire_creds::CredsError;
use blobwire_http::{ResponseError, TransportError};
use thiserror::Error;

/// Errors raised while authenticating and sending API requests.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Sending or classifying the request failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// No credential source produced a user name and password.
    #[error("git credentials for {url} not found")]
    CredentialsNotFound {
        /// Credentials URL that was looked up.
        url: String,
        /// Helper failure, when the helpers reported one.
        #[source]
        source: Option<CredsError>,
    },
    /// The endpoint or remote URL used for credentials is not a URL.
    #[error("invalid credentials URL")]
    InvalidUrl {
        /// URL as configured.
        url: String,
        /// Underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// NTLM needs a `DOMAIN\user` user name.
    #[error("user name must be of the form DOMAIN\\user, it is currently {username:?}")]
    NtlmUsername {
        /// User name supplied by the credential helper.
        username: String,
    },
    /// The server's challenge header carried no usable token.
    #[error("invalid NTLM challenge response")]
    NtlmChallenge {
        /// `WWW-Authenticate` value received.
        header: String,
    },
    /// The decoded NTLM message is malformed.
    #[error("malformed NTLM message")]
    NtlmMessage {
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
}

/// Convenience alias for API results.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Transport error behind this error, if any.
    #[must_use]
    pub const fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }

    /// Classified response behind this error, if any.
    #[must_use]
    pub fn response(&self) -> Option<&ResponseError> {
        self.transport().and_then(TransportError::response)
    }

    /// HTTP status behind this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.transport().and_then(TransportError::status)
    }

    /// Whether the server asked for (other) credentials.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_auth_error())
    }

    /// Whether the caller may retry later.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_retriable())
    }

    /// Whether the operation should not be retried within this session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_fatal(),
            Self::NtlmChallenge { .. } | Self::NtlmMessage { .. } => true,
            _ => false,
        }
    }

    /// Whether the request was refused for security reasons.
    #[must_use]
    pub const fn is_security_error(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_security_error(),
            Self::NtlmChallenge { .. } | Self::NtlmMessage { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntlm_failures_are_fatal_security_errors() {
        let err = ApiError::NtlmChallenge {
            header: "NTLM".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.is_security_error());
        assert!(!err.is_auth_error());
        assert_eq!(err.status(), None);
    }

    #[test]
    fn missing_credentials_name_the_url() {
        let err = ApiError::CredentialsNotFound {
            url: "https://git.example.com/repo".to_string(),
            source: None,
        };
        assert_eq!(
            err.to_string(),
            "git credentials for https://git.example.com/repo not found"
        );
        assert!(!err.is_fatal());
    }
}
