//! Endpoint model and the classifiers that turn remote strings into endpoints.
//!
//! # Design
//! - Resolution never fails; malformed input yields the [`URL_UNKNOWN`]
//!   sentinel so callers decide how to report it.
//! - SSH endpoints always carry an HTTPS fallback URL built from the SSH host
//!   and path, and the SSH path never starts with a slash.
//! - Local paths become `file://` URLs, preferring the repository's `.git`
//!   directory when one exists.

use std::ffi::OsStr;
use std::fmt;
use std::path::PathBuf;

use url::Url;

/// Sentinel URL of an endpoint that could not be resolved.
pub const URL_UNKNOWN: &str = "<unknown>";

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Fetching objects from the server.
    Download,
    /// Sending objects to the server.
    Upload,
}

impl Operation {
    /// Wire name (`download` / `upload`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }

    /// Operation implied by an HTTP method: `GET`/`HEAD` download, anything
    /// else uploads.
    #[must_use]
    pub fn from_method(method: &str) -> Self {
        match method {
            "GET" | "HEAD" => Self::Download,
            _ => Self::Upload,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// SSH routing details of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SshMetadata {
    /// `user@host` or `host`; empty for plain HTTP endpoints.
    pub user_and_host: String,
    /// Explicit SSH port, if any.
    pub port: Option<u16>,
    /// Repository path on the server, without a leading slash.
    pub path: String,
}

impl SshMetadata {
    /// Whether the endpoint is routed over SSH.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        !self.user_and_host.is_empty()
    }
}

/// Resolved address of an LFS server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// HTTP(S) URL of the API, or the SSH fallback URL.
    pub url: String,
    /// SSH routing details.
    pub ssh: SshMetadata,
    /// Operation fixed at resolution time, if any.
    pub operation: Option<Operation>,
}

impl Endpoint {
    /// Plain endpoint addressed by `url`.
    #[must_use]
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Sentinel endpoint for unparsable input.
    #[must_use]
    pub fn unknown() -> Self {
        Self::from_url(URL_UNKNOWN)
    }

    /// Whether this is the unresolved sentinel.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.url == URL_UNKNOWN
    }

    /// Operation for a request using `method`, unless one was fixed earlier.
    #[must_use]
    pub fn operation_for(&self, method: &str) -> Operation {
        self.operation
            .unwrap_or_else(|| Operation::from_method(method))
    }

    /// Endpoint for an `ssh://`, `git+ssh://` or `ssh+git://` URL.
    #[must_use]
    pub fn from_ssh_url(url: &Url) -> Self {
        let Some(host) = url.host_str().filter(|host| !host.is_empty()) else {
            return Self::unknown();
        };
        if host.contains(':') {
            return Self::unknown();
        }

        let user_and_host = if url.username().is_empty() {
            host.to_string()
        } else {
            format!("{}@{host}", url.username())
        };
        let path = url.path().trim_start_matches('/');
        Self {
            url: format!("https://{host}/{path}"),
            ssh: SshMetadata {
                user_and_host,
                port: url.port(),
                path: path.to_string(),
            },
            operation: None,
        }
    }

    /// Endpoint for scp-like SSH syntax.
    ///
    /// Accepts `user@host:path`, `user@host:port:path`,
    /// `[user@host:port]:path` and `user@[host:port]:path`. Input without a
    /// colon is returned untouched as a plain endpoint.
    #[must_use]
    pub fn from_bare_ssh(raw: &str) -> Self {
        let mut authority = String::new();
        let mut rest = raw;
        if let Some(index) = raw.find("@[") {
            authority.push_str(&raw[..=index]);
            rest = &raw[index + 1..];
        }

        let mut bracketed = false;
        if let Some(inner) = rest.strip_prefix('[')
            && let Some(close) = inner.find(']')
        {
            authority.push_str(&inner[..close]);
            rest = &inner[close + 1..];
            bracketed = true;
        }

        let Some(colon) = rest.find(':') else {
            return Self::from_url(raw);
        };
        let mut path = &rest[colon + 1..];
        if !bracketed {
            authority.push_str(&rest[..colon]);
            if let Some((port, tail)) = path.split_once(':')
                && is_port(port)
            {
                authority.push(':');
                authority.push_str(port);
                path = tail;
            }
        }

        let Some((user_and_host, port)) = split_host_port(&authority) else {
            return Self::unknown();
        };
        let host = user_and_host
            .split_once('@')
            .map_or(user_and_host, |(_, host)| host);
        let path = path.trim_start_matches('/');
        Self {
            url: format!("https://{host}/{path}"),
            ssh: SshMetadata {
                user_and_host: user_and_host.to_string(),
                port,
                path: path.to_string(),
            },
            operation: None,
        }
    }
}

fn is_port(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit())
}

fn split_host_port(authority: &str) -> Option<(&str, Option<u16>)> {
    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    };
    if host.is_empty() {
        return None;
    }
    match port {
        None => Some((host, None)),
        Some(port) if is_port(port) => port.parse().ok().map(|port| (host, Some(port))),
        Some(_) => None,
    }
}

/// Rewrite a local repository path as a `file://` URL.
///
/// `<path>/.git` is preferred when it exists and a trailing `/.git` that does
/// not exist collapses to its parent. Paths that do not exist are returned in
/// absolute form without a scheme.
#[must_use]
pub fn rewrite_local_path(raw: &str) -> String {
    let mut path = std::path::absolute(raw).unwrap_or_else(|_| PathBuf::from(raw));
    let git_path = if path.file_name() == Some(OsStr::new(".git")) {
        let git_path = path.clone();
        path.pop();
        git_path
    } else {
        path.join(".git")
    };

    if git_path.exists() {
        path = git_path;
    } else if !path.exists() {
        return path.to_string_lossy().into_owned();
    }

    let display = path.to_string_lossy().replace('\\', "/");
    let slash = if display.starts_with('/') { "" } else { "/" };
    format!("file://{slash}{display}")
}
