//! Platform trust stores consulted in addition to the built-in roots.
//!
//! On macOS the System keychain holds administrator-installed certificates
//! that are not part of the default root set; other platforms add nothing.
//! Keychain lookups run `security` through `tokio::process`.

use reqwest::Certificate;

/// Platform certificates for `host` (`host` or `host:port`).
#[cfg(target_os = "macos")]
pub(crate) async fn root_certificates(host: &str) -> Vec<Certificate> {
    keychain::root_certificates(host).await
}

/// Platform certificates for `host` (`host` or `host:port`).
#[cfg(not(target_os = "macos"))]
pub(crate) fn root_certificates(_host: &str) -> impl Future<Output = Vec<Certificate>> {
    async { Vec::new() }
}

#[cfg(target_os = "macos")]
mod keychain {
    use tokio::process::Command;

    use once_cell::sync::Lazy;
    use regex::Regex;
    use reqwest::Certificate;
    use tracing::debug;

    use crate::certs::parse_certificates;

    const SECURITY: &str = "/usr/bin/security";

    static HOST_WITH_PORT: Lazy<Option<Regex>> =
        Lazy::new(|| Regex::new(r"\A([^:]+):\d+\z").ok());

    pub(super) async fn root_certificates(host: &str) -> Vec<Certificate> {
        let Some(keychain) = system_keychain().await else {
            return Vec::new();
        };
        let mut roots = find_certificates(host, &keychain).await;
        if let Some(bare) = host_without_port(host) {
            roots.extend(find_certificates(bare, &keychain).await);
        }
        roots
    }

    async fn system_keychain() -> Option<String> {
        let output = match Command::new(SECURITY).arg("list-keychains").output().await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(status = ?output.status.code(), "listing keychains failed");
                return None;
            }
            Err(err) => {
                debug!(error = %err, "cannot run security list-keychains");
                return None;
            }
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find(|line| line.to_ascii_lowercase().contains("/system.keychain"))
            .map(|line| line.trim_matches(|ch| matches!(ch, ' ' | '\t' | '"')).to_string())
    }

    async fn find_certificates(host: &str, keychain: &str) -> Vec<Certificate> {
        let output = Command::new(SECURITY)
            .args(["find-certificate", "-a", "-p", "-c", host, keychain])
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                parse_certificates(&output.stdout).unwrap_or_default()
            }
            Ok(_) => Vec::new(),
            Err(err) => {
                debug!(keychain, error = %err, "cannot read keychain");
                Vec::new()
            }
        }
    }

    fn host_without_port(host: &str) -> Option<&str> {
        HOST_WITH_PORT
            .as_ref()?
            .captures(host)
            .and_then(|captures| captures.get(1))
            .map(|bare| bare.as_str())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ports_are_stripped_for_the_second_lookup() {
            assert_eq!(host_without_port("example.com:8443"), Some("example.com"));
            assert_eq!(host_without_port("example.com"), None);
        }
    }
}
