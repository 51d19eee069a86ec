//! Default helper chain assembled from configuration.
//!
//! # Design
//! - Order: netrc, in-memory cache, askpass, `git credential`.
//! - Askpass only joins the chain for URLs without a `credential.helper`.
//! - The chains are built once so skipped helpers stay skipped.

use std::sync::Arc;

use blobwire_config::{ConfigMap, UrlConfig};
use url::Url;

use crate::askpass::AskPassCredentialHelper;
use crate::cache::CredentialCacher;
use crate::chain::CredentialHelpers;
use crate::command::CommandCredentialHelper;
use crate::creds::{Creds, HOST, PATH, PROTOCOL, USERNAME};
use crate::helper::CredentialHelper;
use crate::netrc::NetrcCredentialHelper;

/// Helper to consult for one URL together with the helper input for it.
#[derive(Clone)]
pub struct HelperSelection {
    /// Helper (usually a chain) to fill, approve, and reject with.
    pub helper: Arc<dyn CredentialHelper>,
    /// Fields describing the credential being requested.
    pub input: Creds,
}

/// Builds helper selections for credential URLs.
pub struct CredentialHelperContext {
    git: ConfigMap,
    with_askpass: Arc<CredentialHelpers>,
    without_askpass: Arc<CredentialHelpers>,
    has_askpass: bool,
}

impl std::fmt::Debug for CredentialHelperContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CredentialHelperContext")
            .field("has_askpass", &self.has_askpass)
            .finish_non_exhaustive()
    }
}

impl CredentialHelperContext {
    /// Assemble the default helpers from git and OS configuration.
    #[must_use]
    pub fn new(git: &ConfigMap, os: &ConfigMap) -> Self {
        let mut base: Vec<Arc<dyn CredentialHelper>> = Vec::new();
        if let Some(netrc) = NetrcCredentialHelper::from_environment(os) {
            base.push(Arc::new(netrc));
        }
        if git.bool("lfs.cachecredentials", true) {
            base.push(Arc::new(CredentialCacher::new()));
        }

        let askpass = os
            .get("GIT_ASKPASS")
            .or_else(|| git.get("core.askpass"))
            .or_else(|| os.get("SSH_ASKPASS"))
            .filter(|program| !program.is_empty())
            .map(AskPassCredentialHelper::new);

        let skip_prompt = os
            .get("GIT_TERMINAL_PROMPT")
            .is_some_and(|value| !blobwire_config::parse_bool(value, true));
        let command: Arc<dyn CredentialHelper> = Arc::new(CommandCredentialHelper::new(
            "git",
            skip_prompt,
            git.bool("credential.protectprotocol", true),
        ));

        let mut without = base.clone();
        without.push(command.clone());

        let has_askpass = askpass.is_some();
        let mut with = base;
        if let Some(askpass) = askpass {
            with.push(Arc::new(askpass));
        }
        with.push(command);

        Self {
            git: git.clone(),
            with_askpass: Arc::new(CredentialHelpers::new(with)),
            without_askpass: Arc::new(CredentialHelpers::new(without)),
            has_askpass,
        }
    }

    /// Helper input for `url`: protocol, host, optional user name and path.
    #[must_use]
    pub fn input_for(&self, url: &Url) -> Creds {
        let raw = raw_url(url);
        let mut input = Creds::new();
        input.set(PROTOCOL, url.scheme());
        input.set(HOST, host_with_port(url));
        if !url.username().is_empty() {
            input.set(USERNAME, url.username());
        }
        if url.scheme() == "cert"
            || UrlConfig::new(&self.git).bool("credential", &raw, "usehttppath", false)
        {
            input.set(PATH, url.path().trim_start_matches('/'));
        }
        input
    }

    /// Helper chain and input to use for `url`.
    #[must_use]
    pub fn select(&self, url: &Url) -> HelperSelection {
        let raw = raw_url(url);
        let configured_helper = UrlConfig::new(&self.git)
            .get("credential", &raw, "helper")
            .is_some_and(|helper| !helper.is_empty());
        let helper: Arc<dyn CredentialHelper> = if self.has_askpass && !configured_helper {
            self.with_askpass.clone()
        } else {
            self.without_askpass.clone()
        };
        HelperSelection {
            helper,
            input: self.input_for(url),
        }
    }
}

fn raw_url(url: &Url) -> String {
    format!("{}://{}{}", url.scheme(), host_with_port(url), url.path())
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> anyhow::Result<Url> {
        Ok(Url::parse(raw)?)
    }

    #[test]
    fn input_carries_host_port_and_user() -> anyhow::Result<()> {
        let context = CredentialHelperContext::new(&ConfigMap::git(), &ConfigMap::environment());
        let input = context.input_for(&url("https://alice@git.example.com:8443/org/repo")?);
        assert_eq!(input.first(PROTOCOL), "https");
        assert_eq!(input.first(HOST), "git.example.com:8443");
        assert_eq!(input.first(USERNAME), "alice");
        assert_eq!(input.first(PATH), "");
        Ok(())
    }

    #[test]
    fn use_http_path_adds_path() -> anyhow::Result<()> {
        let git = ConfigMap::git_from_pairs([("credential.https://git.example.com.usehttppath", "true")]);
        let context = CredentialHelperContext::new(&git, &ConfigMap::environment());
        let input = context.input_for(&url("https://git.example.com/org/repo.git/info/lfs")?);
        assert_eq!(input.first(PATH), "org/repo.git/info/lfs");
        let other = context.input_for(&url("https://other.example.com/org/repo")?);
        assert_eq!(other.first(PATH), "");
        Ok(())
    }

    #[test]
    fn askpass_is_dropped_when_a_helper_is_configured() -> anyhow::Result<()> {
        let git = ConfigMap::git_from_pairs([("credential.https://managed.example.com.helper", "store")]);
        let os = ConfigMap::environment_from_pairs([("GIT_ASKPASS", "/usr/bin/askpass")]);
        let context = CredentialHelperContext::new(&git, &os);
        assert!(context.has_askpass);

        let managed = context.select(&url("https://managed.example.com/r")?);
        assert!(Arc::ptr_eq(
            &managed.helper,
            &(context.without_askpass.clone() as Arc<dyn CredentialHelper>)
        ));
        let open = context.select(&url("https://open.example.com/r")?);
        assert!(Arc::ptr_eq(
            &open.helper,
            &(context.with_askpass.clone() as Arc<dyn CredentialHelper>)
        ));
        Ok(())
    }
}
