//! Typed transport settings derived from git and OS configuration.

use std::time::Duration;

use crate::defaults::{
    ACTIVITY_TIMEOUT_SECS, CONCURRENT_TRANSFERS, DIAL_TIMEOUT_SECS, GIT_PROTOCOL, KEEPALIVE_SECS,
    SSH_RETRIES, TLS_TIMEOUT_SECS,
};
use crate::map::ConfigMap;
use crate::url_config::UrlConfig;

/// Process-wide transport settings read once at client construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// TCP connect timeout (`lfs.dialtimeout`).
    pub dial_timeout: Duration,
    /// TCP keepalive interval (`lfs.keepalive`).
    pub keepalive: Duration,
    /// TLS handshake timeout (`lfs.tlstimeout`).
    pub tls_timeout: Duration,
    /// Parallel transfer count; sizes the idle pool per host.
    pub concurrent_transfers: usize,
    /// Disable certificate verification globally.
    pub skip_ssl_verify: bool,
    /// Retries after the first SSH bridge attempt.
    pub ssh_retries: u32,
    /// TTL granted to SSH tokens that carry no expiry.
    pub default_token_ttl: Duration,
    /// Cache SSH tokens and helper credentials in memory.
    pub cache_credentials: bool,
    /// Scheme substituted for `git://` remotes.
    pub git_protocol: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(DIAL_TIMEOUT_SECS),
            keepalive: Duration::from_secs(KEEPALIVE_SECS),
            tls_timeout: Duration::from_secs(TLS_TIMEOUT_SECS),
            concurrent_transfers: CONCURRENT_TRANSFERS,
            skip_ssl_verify: false,
            ssh_retries: SSH_RETRIES,
            default_token_ttl: Duration::ZERO,
            cache_credentials: true,
            git_protocol: GIT_PROTOCOL.to_string(),
        }
    }
}

impl TransportSettings {
    /// Read settings from a git configuration and OS environment snapshot.
    ///
    /// Non-positive timeouts and counts fall back to their defaults.
    #[must_use]
    pub fn from_config(git: &ConfigMap, os: &ConfigMap) -> Self {
        let defaults = Self::default();
        Self {
            dial_timeout: positive_secs(git.int("lfs.dialtimeout", 0))
                .unwrap_or(defaults.dial_timeout),
            keepalive: positive_secs(git.int("lfs.keepalive", 0)).unwrap_or(defaults.keepalive),
            tls_timeout: positive_secs(git.int("lfs.tlstimeout", 0))
                .unwrap_or(defaults.tls_timeout),
            concurrent_transfers: usize::try_from(git.int("lfs.concurrenttransfers", 0))
                .ok()
                .filter(|count| *count > 0)
                .unwrap_or(defaults.concurrent_transfers),
            skip_ssl_verify: !git.bool("http.sslverify", true)
                || os.bool("GIT_SSL_NO_VERIFY", false),
            ssh_retries: u32::try_from(git.int("lfs.ssh.retries", i64::from(SSH_RETRIES)))
                .unwrap_or(0),
            default_token_ttl: positive_secs(git.int("lfs.defaulttokenttl", 0))
                .unwrap_or(Duration::ZERO),
            cache_credentials: git.bool("lfs.cachecredentials", true),
            git_protocol: git
                .get("lfs.gitprotocol")
                .map_or(defaults.git_protocol, str::to_string),
        }
    }
}

/// Per-connection inactivity timeout for `url` (`lfs.<url>.activitytimeout`).
///
/// Unset yields the default; a non-numeric or non-positive value disables it.
#[must_use]
pub fn activity_timeout(git: &ConfigMap, url: &str) -> Option<Duration> {
    match UrlConfig::new(git).get("lfs", url, "activitytimeout") {
        None => Some(Duration::from_secs(ACTIVITY_TIMEOUT_SECS)),
        Some(raw) => raw.trim().parse::<i64>().ok().and_then(positive_secs),
    }
}

fn positive_secs(value: i64) -> Option<Duration> {
    u64::try_from(value)
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_or_invalid_values() {
        let git = ConfigMap::git_from_pairs([
            ("lfs.dialtimeout", "0"),
            ("lfs.keepalive", "-4"),
            ("lfs.concurrenttransfers", "nope"),
            ("lfs.defaulttokenttl", "-60"),
        ]);
        let settings = TransportSettings::from_config(&git, &ConfigMap::environment());
        assert_eq!(settings, TransportSettings::default());
    }

    #[test]
    fn configured_values_override_defaults() {
        let git = ConfigMap::git_from_pairs([
            ("lfs.dialtimeout", "5"),
            ("lfs.tlstimeout", "7"),
            ("lfs.concurrenttransfers", "3"),
            ("lfs.ssh.retries", "1"),
            ("lfs.defaulttokenttl", "120"),
            ("lfs.cachecredentials", "false"),
            ("lfs.gitprotocol", "http"),
        ]);
        let os = ConfigMap::environment_from_pairs([("GIT_SSL_NO_VERIFY", "1")]);
        let settings = TransportSettings::from_config(&git, &os);
        assert_eq!(settings.dial_timeout, Duration::from_secs(5));
        assert_eq!(settings.tls_timeout, Duration::from_secs(7));
        assert_eq!(settings.concurrent_transfers, 3);
        assert_eq!(settings.ssh_retries, 1);
        assert_eq!(settings.default_token_ttl, Duration::from_secs(120));
        assert!(!settings.cache_credentials);
        assert!(settings.skip_ssl_verify);
        assert_eq!(settings.git_protocol, "http");
    }

    #[test]
    fn activity_timeout_is_url_scoped() {
        let git = ConfigMap::git_from_pairs([
            ("lfs.https://slow.example.com.activitytimeout", "90"),
            ("lfs.https://off.example.com.activitytimeout", "never"),
        ]);
        assert_eq!(
            activity_timeout(&git, "https://slow.example.com/r"),
            Some(Duration::from_secs(90))
        );
        assert_eq!(activity_timeout(&git, "https://off.example.com/r"), None);
        assert_eq!(
            activity_timeout(&git, "https://other.example.com/r"),
            Some(Duration::from_secs(30))
        );
    }
}
