//! Proxy selection from git configuration and the OS environment.
//!
//! # Design
//! - `http.<url>.proxy` (falling back to `http.proxy`) beats the environment;
//!   an `https://` value serves HTTPS requests too.
//! - `NO_PROXY` entries match exact hosts, `.suffix` domains, and bare
//!   domains at a label boundary. `localhost` is not special-cased.
//! - A value that does not parse as an HTTP or SOCKS URL is retried with
//!   `http://` prepended.

use blobwire_config::{ConfigMap, UrlConfig};
use tracing::warn;
use url::Url;

/// Chooses the proxy, if any, for each request URL.
#[derive(Debug, Clone)]
pub struct ProxyResolver {
    git: ConfigMap,
    os: ConfigMap,
}

impl ProxyResolver {
    /// Resolver reading `git` and `os` snapshots.
    #[must_use]
    pub fn new(git: &ConfigMap, os: &ConfigMap) -> Self {
        Self {
            git: git.clone(),
            os: os.clone(),
        }
    }

    /// Proxy URL to use for `url`, or `None` to connect directly.
    #[must_use]
    pub fn proxy_for(&self, url: &Url) -> Option<Url> {
        let servers = self.servers(url);
        let https = if url.scheme() == "https" {
            servers.https.filter(|proxy| !proxy.is_empty())
        } else {
            None
        };
        let proxy = https.or(servers.http).filter(|proxy| !proxy.is_empty())?;

        let host = url.host_str().unwrap_or_default();
        if !use_proxy(servers.no_proxy.unwrap_or_default(), host) {
            return None;
        }
        parse_proxy(proxy)
    }

    fn servers(&self, url: &Url) -> ProxyServers<'_> {
        let http = UrlConfig::new(&self.git)
            .get("http", url.as_str(), "proxy")
            .filter(|proxy| !proxy.is_empty());
        let mut https = http.filter(|proxy| proxy.starts_with("https://"));
        if https.is_none() {
            https = self.env_any(&["HTTPS_PROXY", "https_proxy"]);
        }
        ProxyServers {
            https,
            http: http.or_else(|| self.env_any(&["HTTP_PROXY", "http_proxy"])),
            no_proxy: self.env_any(&["NO_PROXY", "no_proxy"]),
        }
    }

    fn env_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|key| self.os.get(key).filter(|value| !value.is_empty()))
    }
}

struct ProxyServers<'a> {
    https: Option<&'a str>,
    http: Option<&'a str>,
    no_proxy: Option<&'a str>,
}

/// Whether a request to `host` should go through a proxy given the
/// comma-separated `no_proxy` list.
#[must_use]
pub fn use_proxy(no_proxy: &str, host: &str) -> bool {
    if host.is_empty() {
        return true;
    }
    if no_proxy.trim() == "*" {
        return false;
    }

    let host = strip_port(host.trim()).to_ascii_lowercase();
    for entry in no_proxy.split(',') {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            continue;
        }
        let entry = strip_port(&entry);
        if host == entry {
            return false;
        }
        if let Some(domain) = entry.strip_prefix('.') {
            if host.ends_with(entry) || host == domain {
                return false;
            }
        } else if host
            .strip_suffix(entry)
            .is_some_and(|prefix| prefix.ends_with('.'))
        {
            return false;
        }
    }
    true
}

fn strip_port(addr: &str) -> &str {
    match (addr.rfind(':'), addr.rfind(']')) {
        (Some(colon), Some(bracket)) if colon > bracket => &addr[..colon],
        (Some(colon), None) => &addr[..colon],
        _ => addr,
    }
}

fn parse_proxy(raw: &str) -> Option<Url> {
    let parsed = Url::parse(raw);
    if let Ok(url) = &parsed
        && (url.scheme().starts_with("http") || url.scheme().starts_with("socks"))
    {
        return Some(url.clone());
    }
    if let Ok(url) = Url::parse(&format!("http://{raw}")) {
        return Some(url);
    }
    warn!(proxy = raw, "ignoring invalid proxy address");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(env: &[(&str, &str)], git: &[(&str, &str)], raw: &str) -> anyhow::Result<Option<Url>> {
        let resolver = ProxyResolver::new(
            &ConfigMap::git_from_pairs(git.iter().copied()),
            &ConfigMap::environment_from_pairs(env.iter().copied()),
        );
        Ok(resolver.proxy_for(&Url::parse(raw)?))
    }

    fn host_port(url: Option<Url>) -> Option<String> {
        url.map(|url| format!("{}:{}", url.host_str().unwrap_or_default(), url.port().unwrap_or(0)))
    }

    #[test]
    fn git_config_beats_environment() -> anyhow::Result<()> {
        let https = resolve(
            &[("HTTPS_PROXY", "https://proxy-from-env:8080")],
            &[("http.proxy", "https://proxy-from-git-config:8080")],
            "https://some-host.com:123/foo/bar",
        )?;
        assert_eq!(host_port(https).as_deref(), Some("proxy-from-git-config:8080"));

        let http = resolve(
            &[("HTTPS_PROXY", "https://proxy-from-env:8080")],
            &[("http.proxy", "http://proxy-from-git-config:8080")],
            "http://some-host.com:123/foo/bar",
        )?;
        assert_eq!(host_port(http).as_deref(), Some("proxy-from-git-config:8080"));
        Ok(())
    }

    #[test]
    fn url_scoped_proxy_beats_global() -> anyhow::Result<()> {
        let proxy = resolve(
            &[],
            &[
                ("http.proxy", "https://proxy-for-everyone:8080"),
                ("http.https://some-host.com:123.proxy", "https://proxy-for-some-host:8080"),
            ],
            "https://some-host.com:123/foo/bar",
        )?;
        assert_eq!(host_port(proxy).as_deref(), Some("proxy-for-some-host:8080"));
        Ok(())
    }

    #[test]
    fn environment_and_socks_proxies() -> anyhow::Result<()> {
        let env = resolve(
            &[("HTTPS_PROXY", "https://proxy-from-env:8080")],
            &[],
            "https://some-host.com:123/foo/bar",
        )?;
        assert_eq!(host_port(env).as_deref(), Some("proxy-from-env:8080"));

        let socks = resolve(
            &[("HTTPS_PROXY", "socks5://proxy-from-env:3128")],
            &[],
            "https://some-host.com:123/foo/bar",
        )?
        .ok_or_else(|| anyhow::anyhow!("expected a proxy"))?;
        assert_eq!(socks.scheme(), "socks5");
        assert_eq!(socks.port(), Some(3128));

        let bare = resolve(&[("http_proxy", "proxy.local:3128")], &[], "http://some-host.com/")?
            .ok_or_else(|| anyhow::anyhow!("expected a proxy"))?;
        assert_eq!(bare.as_str(), "http://proxy.local:3128/");
        Ok(())
    }

    #[test]
    fn no_proxy_and_absent_configuration() -> anyhow::Result<()> {
        assert_eq!(resolve(&[], &[], "http://some-host.com:123/foo/bar")?, None);
        assert_eq!(
            resolve(
                &[("NO_PROXY", "some-host")],
                &[("http.proxy", "https://proxy-from-git-config:8080")],
                "https://some-host:8080",
            )?,
            None
        );
        Ok(())
    }

    #[test]
    fn no_proxy_matching_rules() {
        assert!(!use_proxy("*", "example.com"));
        assert!(!use_proxy("example.com", "example.com:443"));
        assert!(!use_proxy(".example.com", "api.example.com"));
        assert!(!use_proxy(".example.com", "example.com"));
        assert!(!use_proxy("example.com", "api.example.com"));
        assert!(use_proxy("example.com", "badexample.com"));
        assert!(use_proxy("other.com, , foo.org:80", "example.com"));
        assert!(use_proxy("", "localhost"));
        assert!(use_proxy("example.com", ""));
    }
}
