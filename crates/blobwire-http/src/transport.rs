//! Per-host HTTP clients.
//!
//! # Design
//! - One [`reqwest::Client`] per `(authority, access mode)`, built on first
//!   use and shared afterwards. The cache lock is not held while building;
//!   when two builds race, the first client stored wins.
//! - Redirects are never followed by the client; the executor handles them.
//! - The TLS handshake budget is folded into the connect timeout, and the
//!   per-URL activity timeout becomes the client's read timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use blobwire_config::{ConfigMap, TransportSettings, UrlConfig, activity_timeout};
use blobwire_endpoint::AccessMode;
use reqwest::{Client, Proxy, redirect};
use tracing::debug;
use url::Url;

use crate::certs::{self, KeyPassphrases};
use crate::error::{HttpResult, TransportError};
use crate::proxy::ProxyResolver;

/// Protocol version pinned through `http.<url>.version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// Let ALPN decide.
    Negotiate,
    /// HTTP/1.1 only.
    Http1,
    /// HTTP/2 only; requires HTTPS.
    Http2,
}

/// Protocol pin for `url`.
///
/// # Errors
///
/// Returns an error for unknown versions and for HTTP/2 over plain HTTP.
pub fn http_version(git: &ConfigMap, url: &Url) -> HttpResult<HttpVersion> {
    match UrlConfig::new(git).get("http", url.as_str(), "version").unwrap_or_default() {
        "" => Ok(HttpVersion::Negotiate),
        "HTTP/1.1" => Ok(HttpVersion::Http1),
        "HTTP/2" if url.scheme() == "https" => Ok(HttpVersion::Http2),
        "HTTP/2" => Err(TransportError::Http2RequiresTls {
            url: url.to_string(),
        }),
        other => Err(TransportError::UnknownHttpVersion {
            version: other.to_string(),
        }),
    }
}

/// Host and explicit port of `url`, as used for certificate lookups.
#[must_use]
pub fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Builds and caches clients keyed by `(authority, access mode)`.
pub struct HostClientCache {
    git: ConfigMap,
    os: ConfigMap,
    settings: TransportSettings,
    user_agent: String,
    proxy: Arc<ProxyResolver>,
    passphrases: KeyPassphrases,
    clients: Mutex<HashMap<(String, AccessMode), Client>>,
}

impl std::fmt::Debug for HostClientCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HostClientCache")
            .field("clients", &self.lock().len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl HostClientCache {
    /// Empty cache for clients configured from `git` and `os`.
    #[must_use]
    pub fn new(git: &ConfigMap, os: &ConfigMap, user_agent: impl Into<String>) -> Self {
        Self {
            git: git.clone(),
            os: os.clone(),
            settings: TransportSettings::from_config(git, os),
            user_agent: user_agent.into(),
            proxy: Arc::new(ProxyResolver::new(git, os)),
            passphrases: KeyPassphrases::from_config(git, os),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Ask `passphrases` for encrypted client key passphrases.
    #[must_use]
    pub fn with_key_passphrases(mut self, passphrases: KeyPassphrases) -> Self {
        self.passphrases = passphrases;
        self
    }

    /// Settings every client is built with.
    #[must_use]
    pub const fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Client for requests to `url` under `mode`.
    ///
    /// # Errors
    ///
    /// Returns an error when the protocol pin is invalid or the client cannot
    /// be built.
    pub async fn client_for(&self, url: &Url, mode: AccessMode) -> HttpResult<Client> {
        let version = http_version(&self.git, url)?;
        let key = (authority(url), mode);
        if let Some(client) = self.lock().get(&key) {
            return Ok(client.clone());
        }
        let client = self.build(url, &key.0, version).await?;
        debug!(host = %key.0, mode = %mode, "built http client");
        Ok(self.lock().entry(key).or_insert(client).clone())
    }

    /// Number of distinct clients built so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no client has been built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn build(&self, url: &Url, host: &str, version: HttpVersion) -> HttpResult<Client> {
        let proxy = Arc::clone(&self.proxy);
        let mut builder = Client::builder()
            .connect_timeout(self.settings.dial_timeout + self.settings.tls_timeout)
            .tcp_keepalive(self.settings.keepalive)
            .pool_max_idle_per_host(self.settings.concurrent_transfers)
            .redirect(redirect::Policy::none())
            .user_agent(self.user_agent.clone())
            .proxy(Proxy::custom(move |target| proxy.proxy_for(target)));

        if let Some(timeout) = activity_timeout(&self.git, url.as_str()) {
            builder = builder.read_timeout(timeout);
        }
        builder = match version {
            HttpVersion::Negotiate => builder,
            HttpVersion::Http1 => builder.http1_only(),
            HttpVersion::Http2 => builder.http2_prior_knowledge(),
        };

        if certs::verification_disabled(&self.git, host, self.settings.skip_ssl_verify) {
            debug!(host, "certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        } else {
            for root in certs::root_certificates(&self.git, &self.os, host).await {
                builder = builder.add_root_certificate(root);
            }
        }
        if let Some(identity) = certs::client_identity(&self.git, host, &self.passphrases).await {
            builder = builder.identity(identity);
        }

        builder.build().map_err(|source| TransportError::ClientBuild {
            host: host.to_string(),
            source,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, AccessMode), Client>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(pairs: &[(&str, &str)]) -> HostClientCache {
        HostClientCache::new(
            &ConfigMap::git_from_pairs(pairs.iter().copied()),
            &ConfigMap::environment(),
            "blobwire-test",
        )
    }

    #[tokio::test]
    async fn clients_are_shared_per_host_and_mode() -> anyhow::Result<()> {
        let cache = cache(&[]);
        let a = Url::parse("https://a.example.com/repo")?;
        let a_other_path = Url::parse("https://a.example.com/other")?;
        let a_port = Url::parse("https://a.example.com:8443/repo")?;

        cache.client_for(&a, AccessMode::Basic).await?;
        cache.client_for(&a_other_path, AccessMode::Basic).await?;
        assert_eq!(cache.len(), 1);

        cache.client_for(&a, AccessMode::Ntlm).await?;
        cache.client_for(&a_port, AccessMode::Basic).await?;
        assert_eq!(cache.len(), 3);
        Ok(())
    }

    #[test]
    fn protocol_pins_are_validated() -> anyhow::Result<()> {
        let git = ConfigMap::git_from_pairs([
            ("http.https://h1.example.com.version", "HTTP/1.1"),
            ("http.https://h2.example.com.version", "HTTP/2"),
            ("http.http://h2.example.com.version", "HTTP/2"),
            ("http.https://odd.example.com.version", "SPDY/3"),
        ]);
        assert_eq!(
            http_version(&git, &Url::parse("https://h1.example.com/")?)?,
            HttpVersion::Http1
        );
        assert_eq!(
            http_version(&git, &Url::parse("https://h2.example.com/")?)?,
            HttpVersion::Http2
        );
        assert_eq!(
            http_version(&git, &Url::parse("https://plain.example.com/")?)?,
            HttpVersion::Negotiate
        );
        assert!(matches!(
            http_version(&git, &Url::parse("http://h2.example.com/")?),
            Err(TransportError::Http2RequiresTls { .. })
        ));
        assert!(matches!(
            http_version(&git, &Url::parse("https://odd.example.com/")?),
            Err(TransportError::UnknownHttpVersion { version }) if version == "SPDY/3"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_pins_fail_before_building() -> anyhow::Result<()> {
        let cache = cache(&[("http.version", "HTTP/9")]);
        assert!(
            cache
                .client_for(&Url::parse("https://example.com")?, AccessMode::None)
                .await
                .is_err()
        );
        assert!(cache.is_empty());
        Ok(())
    }

    #[test]
    fn authority_keeps_explicit_ports_only() -> anyhow::Result<()> {
        assert_eq!(authority(&Url::parse("https://example.com:443/x")?), "example.com");
        assert_eq!(authority(&Url::parse("https://example.com:8443/x")?), "example.com:8443");
        Ok(())
    }
}
