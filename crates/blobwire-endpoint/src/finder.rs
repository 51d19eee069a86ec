//! Remote and alias resolution.
//!
//! # Design
//! - Aliases are read once from `url.<base>.insteadof` and
//!   `url.<base>.pushinsteadof`; the longest matching alias wins and push
//!   aliases take precedence for uploads.
//! - Precedence: `lfs.pushurl` (uploads), `lfs.url`, the named remote's
//!   `lfspushurl`/`lfsurl`, its git URL, then the same chain for `origin`.
//! - Clone URLs gain the implicit `/info/lfs` suffix; explicit LFS URLs are
//!   used verbatim.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use blobwire_config::ConfigMap;
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, Operation, rewrite_local_path};
use crate::error::{EndpointError, EndpointResult};

/// Remote consulted when no remote is named or the named one has no URL.
pub const DEFAULT_REMOTE: &str = "origin";

const ALIAS_PREFIX: &str = "url.";
const INSTEAD_OF: &str = ".insteadof";
const PUSH_INSTEAD_OF: &str = ".pushinsteadof";

/// Resolves endpoints from a git configuration snapshot.
#[derive(Debug, Clone)]
pub struct EndpointFinder {
    git: ConfigMap,
    git_protocol: String,
    aliases: BTreeMap<String, String>,
    push_aliases: BTreeMap<String, String>,
}

impl EndpointFinder {
    /// Build a finder over `git`.
    #[must_use]
    pub fn new(git: &ConfigMap) -> Self {
        let mut aliases = BTreeMap::new();
        let mut push_aliases = BTreeMap::new();
        for (key, values) in git.iter() {
            let Some(rest) = key.strip_prefix(ALIAS_PREFIX) else {
                continue;
            };
            if let Some(base) = rest.strip_suffix(INSTEAD_OF) {
                store_aliases(&mut aliases, base, values, "insteadof");
            } else if let Some(base) = rest.strip_suffix(PUSH_INSTEAD_OF) {
                store_aliases(&mut push_aliases, base, values, "pushinsteadof");
            }
        }

        Self {
            git: git.clone(),
            git_protocol: git.get("lfs.gitprotocol").unwrap_or("https").to_string(),
            aliases,
            push_aliases,
        }
    }

    /// Protocol substituted for `git://` URLs.
    #[must_use]
    pub fn git_protocol(&self) -> &str {
        &self.git_protocol
    }

    /// Endpoint for `operation` against `remote` (empty for the default).
    #[must_use]
    pub fn endpoint(&self, operation: Operation, remote: &str) -> Endpoint {
        let mut endpoint = self.find_endpoint(operation, remote);
        endpoint.operation = Some(operation);
        endpoint
    }

    fn find_endpoint(&self, operation: Operation, remote: &str) -> Endpoint {
        if operation == Operation::Upload
            && let Some(url) = self.git.get("lfs.pushurl")
        {
            return self.new_endpoint(operation, url);
        }
        if let Some(url) = self.git.get("lfs.url") {
            return self.new_endpoint(operation, url);
        }
        if !remote.is_empty() && remote != DEFAULT_REMOTE {
            let endpoint = self.remote_endpoint(operation, remote);
            if !endpoint.url.is_empty() {
                return endpoint;
            }
        }
        self.remote_endpoint(operation, DEFAULT_REMOTE)
    }

    /// Endpoint configured for one remote, ignoring the global `lfs.url`.
    ///
    /// Returns an endpoint with an empty URL when the remote has none.
    #[must_use]
    pub fn remote_endpoint(&self, operation: Operation, remote: &str) -> Endpoint {
        let remote = if remote.is_empty() {
            DEFAULT_REMOTE
        } else {
            remote
        };

        if operation == Operation::Upload
            && let Some(url) = self.git.get(&format!("remote.{remote}.lfspushurl"))
        {
            return self.new_endpoint(operation, url);
        }
        if let Some(url) = self.git.get(&format!("remote.{remote}.lfsurl")) {
            return self.new_endpoint(operation, url);
        }
        match self.git_remote_url(remote, operation == Operation::Upload) {
            Some(url) => self.new_endpoint_from_clone_url(operation, &url),
            None => Endpoint::default(),
        }
    }

    /// URL git itself uses for `remote`.
    ///
    /// A remote name that is not configured but looks like a URL is
    /// returned as-is.
    #[must_use]
    pub fn git_remote_url(&self, remote: &str, for_push: bool) -> Option<String> {
        if for_push && let Some(url) = self.git.get(&format!("remote.{remote}.pushurl")) {
            return Some(url.to_string());
        }
        if let Some(url) = self.git.get(&format!("remote.{remote}.url")) {
            return Some(url.to_string());
        }
        if self.remotes().contains(remote) || validate_remote_url(remote).is_ok() {
            return Some(remote.to_string());
        }
        None
    }

    fn remotes(&self) -> BTreeSet<&str> {
        self.git
            .iter()
            .filter_map(|(key, _)| key.strip_prefix("remote."))
            .filter_map(|rest| rest.rsplit_once('.').map(|(name, _)| name))
            .collect()
    }

    /// Endpoint for a git clone URL, with the implicit LFS suffix.
    #[must_use]
    pub fn new_endpoint_from_clone_url(&self, operation: Operation, raw: &str) -> Endpoint {
        let mut endpoint = self.new_endpoint(operation, raw);
        if endpoint.is_unknown() {
            return endpoint;
        }
        if raw.ends_with('/')
            && let Some(trimmed) = endpoint.url.strip_suffix('/')
        {
            endpoint.url = trimmed.to_string();
        }
        if endpoint.url.starts_with("file://") {
            return endpoint;
        }

        if endpoint.url.ends_with(".git") {
            endpoint.url.push_str("/info/lfs");
        } else {
            endpoint.url.push_str(".git/info/lfs");
        }
        endpoint
    }

    /// Endpoint for an explicit URL, after alias substitution.
    #[must_use]
    pub fn new_endpoint(&self, operation: Operation, raw: &str) -> Endpoint {
        let raw = self.replace_url_alias(operation, raw);
        if raw.starts_with('/') {
            return Endpoint::from_url(rewrite_local_path(&raw));
        }

        match url_scheme(&raw) {
            Some("ssh" | "git+ssh" | "ssh+git") => match url::Url::parse(&raw) {
                Ok(url) => Endpoint::from_ssh_url(&url),
                Err(err) => {
                    debug!(error = %err, "unparsable ssh remote");
                    Endpoint::unknown()
                }
            },
            Some("http" | "https" | "file") => Endpoint::from_url(raw.as_str()),
            Some("git") => {
                Endpoint::from_url(format!("{}{}", self.git_protocol, &raw["git".len()..]))
            }
            Some(scheme) if raw[scheme.len()..].starts_with("::") => Endpoint::from_url(raw.as_str()),
            _ if Path::new(&raw).exists() => Endpoint::from_url(rewrite_local_path(&raw)),
            _ => Endpoint::from_bare_ssh(&raw),
        }
    }

    /// Apply the longest matching `insteadof` alias; uploads try
    /// `pushinsteadof` first.
    #[must_use]
    pub fn replace_url_alias(&self, operation: Operation, raw: &str) -> String {
        if operation == Operation::Upload
            && let Some(replaced) = replace_alias(&self.push_aliases, raw)
        {
            return replaced;
        }
        replace_alias(&self.aliases, raw).unwrap_or_else(|| raw.to_string())
    }
}

fn store_aliases(
    aliases: &mut BTreeMap<String, String>,
    base: &str,
    values: &[String],
    kind: &'static str,
) {
    for value in values.iter().filter(|value| !value.is_empty()) {
        if let Some(previous) = aliases.insert(value.clone(), base.to_string())
            && previous != base
        {
            warn!(alias = %value, kind, "multiple url aliases share the same prefix");
        }
    }
}

fn replace_alias(aliases: &BTreeMap<String, String>, raw: &str) -> Option<String> {
    aliases
        .iter()
        .filter(|(alias, _)| raw.starts_with(alias.as_str()))
        .max_by_key(|(alias, _)| alias.len())
        .map(|(alias, base)| format!("{base}{}", &raw[alias.len()..]))
}

/// Scheme of `raw` when it starts with `<alpha>[alnum+-.]*:`.
fn url_scheme(raw: &str) -> Option<&str> {
    let (scheme, _) = raw.split_once(':')?;
    let mut bytes = scheme.bytes();
    let first = bytes.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    bytes
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'-' | b'.'))
        .then_some(scheme)
}

/// Check that `remote` looks like a URL git can fetch from.
///
/// Scheme-less input is accepted when it contains a colon (scp-like SSH).
///
/// # Errors
///
/// Returns an error for scheme-less names without a colon and for
/// unsupported schemes.
pub fn validate_remote_url(remote: &str) -> EndpointResult<()> {
    match url_scheme(remote) {
        None if remote.contains(':') => Ok(()),
        None => Err(EndpointError::InvalidRemote {
            remote: remote.to_string(),
        }),
        Some("ssh" | "http" | "https" | "git" | "file") => Ok(()),
        Some(scheme) => Err(EndpointError::InvalidRemoteProtocol {
            scheme: scheme.to_string(),
            remote: remote.to_string(),
        }),
    }
}
