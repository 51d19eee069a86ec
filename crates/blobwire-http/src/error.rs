//! Error types for request construction, execution, and response
//! classification.
//!
//! # Design
//! - Response-bearing variants box a [`ResponseError`] so results stay small.
//! - The predicates answer what a caller does next: re-authenticate, retry
//!   later, or stop for the rest of the session.

use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use thiserror::Error;
use url::Url;

/// Details of an HTTP response with a status of 400 or above.
#[derive(Debug, Clone)]
pub struct ResponseError {
    /// HTTP status code.
    pub status: u16,
    /// Method of the request that failed.
    pub method: String,
    /// Request URL with the query string removed.
    pub url: String,
    /// Message supplied by the server in a JSON error body.
    pub message: Option<String>,
    /// Documentation link supplied by the server.
    pub documentation_url: Option<String>,
    /// Request identifier supplied by the server.
    pub request_id: Option<String>,
    /// Response headers, kept for challenge parsing.
    pub headers: HeaderMap,
}

impl ResponseError {
    /// Error for `status` returned to `method url`.
    #[must_use]
    pub fn new(status: u16, method: &str, url: &Url, headers: HeaderMap) -> Self {
        Self {
            status,
            method: method.to_string(),
            url: url_without_query(url),
            message: None,
            documentation_url: None,
            request_id: None,
            headers,
        }
    }

    /// First value of response header `name`, if it is valid text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// One-line description without the docs and request id trailers.
    #[must_use]
    pub fn summary(&self) -> String {
        let target = format!("{} {}", self.method, self.url);
        match &self.message {
            Some(message) => format!("{message} ({target})"),
            None => default_message(self.status, &target),
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.summary())?;
        if let Some(docs) = &self.documentation_url {
            write!(formatter, "\nDocs: {docs}")?;
        }
        if let Some(request_id) = &self.request_id {
            write!(formatter, "\nRequest ID: {request_id}")?;
        }
        Ok(())
    }
}

fn default_message(status: u16, target: &str) -> String {
    match status {
        400 => format!("Client error: {target}"),
        401 | 403 => format!(
            "Authorization error: {target}\nCheck that you have proper access to the repository"
        ),
        404 => format!(
            "Repository or object not found: {target}\nCheck that it exists and that you have proper access to it"
        ),
        422 => format!("Unprocessable entity: {target}"),
        429 => format!("Rate limit exceeded: {target}"),
        500 => format!("Server error: {target}"),
        501 => format!("Not Implemented: {target}"),
        507 => format!("Insufficient server storage: {target}"),
        509 => format!("Bandwidth limit exceeded: {target}"),
        status if status < 500 => format!("Client error {target} from HTTP {status}"),
        status => format!("Server error {target} from HTTP {status}"),
    }
}

/// `url` without its query string or fragment.
#[must_use]
pub fn url_without_query(url: &Url) -> String {
    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.set_fragment(None);
    stripped.to_string()
}

/// Errors raised by the SSH credential bridge.
#[derive(Debug, Error)]
pub enum SshError {
    /// The SSH program could not be started.
    #[error("failed to start ssh")]
    Spawn {
        /// Program that was spawned.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The remote authenticate command failed.
    #[error("ssh: {message}")]
    Command {
        /// Program that was spawned.
        program: String,
        /// Exit code when the process was not killed by a signal.
        code: Option<i32>,
        /// Trimmed standard error output.
        message: String,
    },
    /// Standard output was not a valid token document.
    #[error("invalid ssh authentication response")]
    Decode {
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience alias for SSH bridge results.
pub type SshResult<T> = Result<T, SshError>;

/// Errors raised while decrypting a client private key.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The PEM armor or its encryption headers could not be parsed.
    #[error("malformed private key: {reason}")]
    Malformed {
        /// What was wrong.
        reason: String,
    },
    /// The legacy `DEK-Info` names a cipher that is not supported.
    #[error("unsupported private key cipher {cipher:?}")]
    UnsupportedCipher {
        /// Cipher name as written in the key.
        cipher: String,
    },
    /// Decryption failed, usually because the passphrase is wrong.
    #[error("failed to decrypt private key")]
    Decrypt,
}

/// Convenience alias for key decryption results.
pub type KeyResult<T> = Result<T, KeyError>;

/// Errors raised while building, sending, or classifying requests.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint URL is not HTTP or HTTPS.
    #[error("missing protocol: {url:?}")]
    MissingProtocol {
        /// Offending URL, query string removed.
        url: String,
    },
    /// A request URL could not be parsed.
    #[error("invalid request URL")]
    InvalidUrl {
        /// URL as supplied.
        url: String,
        /// Underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// A header name or value cannot be sent.
    #[error("invalid request header")]
    InvalidHeader {
        /// Header name.
        name: String,
    },
    /// Serializing a JSON body failed.
    #[error("failed to encode request body")]
    EncodeBody {
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// The request failed below HTTP (DNS, connect, TLS, timeout).
    #[error("request failed: {method} {url}")]
    Send {
        /// Request method.
        method: String,
        /// Request URL, query string removed.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The redirect chain exceeded its ceiling.
    #[error("too many redirects: {method} {url}")]
    TooManyRedirects {
        /// Request method.
        method: String,
        /// Last URL requested, query string removed.
        url: String,
    },
    /// A redirect pointed from HTTPS to plain HTTP.
    #[error("refusing insecure redirect from {from} to {to}")]
    InsecureRedirect {
        /// URL that answered with the redirect.
        from: String,
        /// Downgraded location.
        to: String,
    },
    /// A redirect response carried no usable `Location`.
    #[error("invalid redirect location")]
    InvalidRedirect {
        /// URL that answered with the redirect.
        url: String,
        /// Raw `Location` value, empty when absent.
        location: String,
    },
    /// The per-host client could not be constructed.
    #[error("failed to build HTTP client")]
    ClientBuild {
        /// Host the client was built for.
        host: String,
        /// Underlying builder error.
        #[source]
        source: reqwest::Error,
    },
    /// `HTTP/2` was pinned for a plain HTTP URL.
    #[error("HTTP/2 requires TLS")]
    Http2RequiresTls {
        /// Request URL.
        url: String,
    },
    /// `http.<url>.version` holds an unsupported value.
    #[error("unknown HTTP version {version:?}")]
    UnknownHttpVersion {
        /// Configured value.
        version: String,
    },
    /// The SSH credential bridge failed after its retries.
    #[error("failed to resolve SSH credentials")]
    Ssh {
        /// SSH destination.
        user_and_host: String,
        /// Last bridge error.
        #[source]
        source: SshError,
    },
    /// HTTP 401.
    #[error("{response}")]
    Auth {
        /// Response details.
        response: Box<ResponseError>,
    },
    /// HTTP 422.
    #[error("{response}")]
    Unprocessable {
        /// Response details.
        response: Box<ResponseError>,
    },
    /// HTTP 429.
    #[error("{response}")]
    RetryLater {
        /// Response details.
        response: Box<ResponseError>,
        /// Instant named by `Retry-After`, when it could be parsed.
        retry_at: Option<DateTime<Utc>>,
    },
    /// HTTP 501, 507 or 509.
    #[error("{response}")]
    Retriable {
        /// Response details.
        response: Box<ResponseError>,
    },
    /// Any other 5xx.
    #[error("{response}")]
    Fatal {
        /// Response details.
        response: Box<ResponseError>,
    },
    /// Any other 4xx.
    #[error("{response}")]
    Client {
        /// Response details.
        response: Box<ResponseError>,
    },
    /// The response is not a JSON media type.
    #[error("unsupported content type for JSON decoding")]
    DecodeType {
        /// `Content-Type` received.
        content_type: String,
    },
    /// The response body is not valid JSON for the expected type.
    #[error("failed to decode response body")]
    Decode {
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// Reading the response body failed.
    #[error("failed to read response body")]
    ReadBody {
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
}

/// Convenience alias for transport results.
pub type HttpResult<T> = Result<T, TransportError>;

impl TransportError {
    /// Response details for status-classified errors.
    #[must_use]
    pub fn response(&self) -> Option<&ResponseError> {
        match self {
            Self::Auth { response }
            | Self::Unprocessable { response }
            | Self::RetryLater { response, .. }
            | Self::Retriable { response }
            | Self::Fatal { response }
            | Self::Client { response } => Some(response),
            _ => None,
        }
    }

    /// HTTP status of status-classified errors.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.response().map(|response| response.status)
    }

    /// Whether the server rejected the request's credentials.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Whether the caller may retry the operation later.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::RetryLater { .. } | Self::Retriable { .. })
    }

    /// Whether the caller should stop retrying for this session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. }) || self.is_security_error()
    }

    /// Whether following the response would weaken transport security.
    #[must_use]
    pub const fn is_security_error(&self) -> bool {
        matches!(self, Self::InsecureRedirect { .. })
    }

    /// Whether the server answered 422.
    #[must_use]
    pub const fn is_unprocessable(&self) -> bool {
        matches!(self, Self::Unprocessable { .. })
    }

    /// Earliest instant a 429 may be retried, when the server named one.
    #[must_use]
    pub const fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RetryLater { retry_at, .. } => *retry_at,
            _ => None,
        }
    }
}
