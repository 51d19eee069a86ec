//! Certificate configuration for per-host clients.
//!
//! # Design
//! - `host` is the URL authority (`host` or `host:port`); settings are read
//!   through `http.https://<host>/` matching.
//! - Root sources are exclusive: the first of `GIT_SSL_CAINFO`,
//!   `http.<url>.sslcainfo`, `GIT_SSL_CAPATH`, `http.sslcapath` that is set
//!   supplies all configured roots. Platform roots are added on top.
//! - Unreadable or malformed files are logged and skipped; the built-in
//!   roots stay in place.
//! - Encrypted client keys are unlocked with a passphrase from the credential
//!   helpers, asked for `cert:///<key path>`. The passphrase is approved when
//!   the key decrypts and rejected when it does not.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use blobwire_config::{ConfigMap, UrlConfig, parse_bool};
use blobwire_creds::creds::{PASSWORD, USERNAME};
use blobwire_creds::{CredentialHelper, CredentialHelperContext, Creds};
use reqwest::{Certificate, Identity};
use tracing::{debug, warn};
use url::Url;

use crate::keys;
use crate::platform;

/// Whether certificate verification is off for `host`.
#[must_use]
pub fn verification_disabled(git: &ConfigMap, host: &str, skip_ssl_verify: bool) -> bool {
    let url = format!("https://{host}");
    UrlConfig::new(git).get("http", &url, "sslverify") == Some("false") || skip_ssl_verify
}

/// Credential helpers asked for client key passphrases.
#[derive(Clone)]
pub struct KeyPassphrases {
    context: Arc<CredentialHelperContext>,
    helper: Option<Arc<dyn CredentialHelper>>,
}

impl std::fmt::Debug for KeyPassphrases {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("KeyPassphrases")
            .field("context", &self.context)
            .field("overridden", &self.helper.is_some())
            .finish_non_exhaustive()
    }
}

impl KeyPassphrases {
    /// Passphrases from the helper chain `context` selects, or from `helper`
    /// when given.
    #[must_use]
    pub const fn new(
        context: Arc<CredentialHelperContext>,
        helper: Option<Arc<dyn CredentialHelper>>,
    ) -> Self {
        Self { context, helper }
    }

    /// Passphrases from the default helper chain for `git` and `os`.
    #[must_use]
    pub fn from_config(git: &ConfigMap, os: &ConfigMap) -> Self {
        Self::new(Arc::new(CredentialHelperContext::new(git, os)), None)
    }

    /// Decrypt `pem`, read from `key_path`, with a passphrase from the
    /// helpers, then approve or reject that passphrase.
    async fn unlock(&self, key_path: &str, pem: &str, cert: &[u8]) -> Option<Identity> {
        let url = key_url(key_path)?;
        let selection = self.context.select(&url);
        let helper = self.helper.clone().unwrap_or(selection.helper);
        let mut input = selection.input;
        input.set(USERNAME, "");

        let creds = match helper.fill(&input).await {
            Ok(Some(creds)) => creds,
            Ok(None) => Creds::new(),
            Err(err) => {
                warn!(url = %url, error = %err, "cannot fill client key passphrase");
                return None;
            }
        };
        let identity = match keys::decrypt_private_key(pem, creds.first(PASSWORD)) {
            Ok(key) => identity_from_pem(cert, key.as_bytes(), key_path),
            Err(err) => {
                warn!(path = key_path, error = %err, "cannot decrypt client key");
                None
            }
        };

        let outcome = if identity.is_some() {
            helper.approve(&creds).await
        } else {
            helper.reject(&creds).await
        };
        if let Err(err) = outcome {
            warn!(url = %url, error = %err, "cannot store client key passphrase outcome");
        }
        identity
    }
}

fn key_url(key_path: &str) -> Option<Url> {
    let raw = format!("cert:///{}", key_path.replace('\\', "/"));
    match Url::parse(&raw) {
        Ok(url) => Some(url),
        Err(err) => {
            warn!(path = key_path, error = %err, "cannot build passphrase URL");
            None
        }
    }
}

/// Client identity from `http.<url>.sslcert` and `http.<url>.sslkey`.
///
/// Encrypted keys are decrypted with a passphrase from `passphrases`; any
/// failure is logged and yields `None`.
#[must_use]
pub async fn client_identity(
    git: &ConfigMap,
    host: &str,
    passphrases: &KeyPassphrases,
) -> Option<Identity> {
    let url = format!("https://{host}/");
    let config = UrlConfig::new(git);
    let key_path = config.get("http", &url, "sslkey")?;
    let cert_path = config.get("http", &url, "sslcert")?;

    let cert = read_tls_file(cert_path, "client certificate").await?;
    let key = read_tls_file(key_path, "client key").await?;
    let key_pem = String::from_utf8_lossy(&key);
    if keys::is_encrypted(&key_pem) {
        return passphrases.unlock(key_path, &key_pem, &cert).await;
    }
    identity_from_pem(&cert, &key, key_path)
}

fn identity_from_pem(cert: &[u8], key: &[u8], key_path: &str) -> Option<Identity> {
    let mut pem = cert.to_vec();
    if !pem.ends_with(b"\n") {
        pem.push(b'\n');
    }
    pem.extend_from_slice(key);
    match Identity::from_pem(&pem) {
        Ok(identity) => Some(identity),
        Err(err) => {
            warn!(error = %err, key = key_path, "invalid client certificate");
            None
        }
    }
}

async fn read_tls_file(path: &str, what: &'static str) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(data) => Some(data),
        Err(err) => {
            debug!(path, error = %err, what, "cannot read TLS material");
            None
        }
    }
}

/// Additional trusted roots for `host` from configuration and the platform.
#[must_use]
pub async fn root_certificates(git: &ConfigMap, os: &ConfigMap, host: &str) -> Vec<Certificate> {
    let (git, os, authority) = (git.clone(), os.clone(), host.to_string());
    let mut roots = tokio::task::spawn_blocking(move || configured_roots(&git, &os, &authority))
        .await
        .unwrap_or_else(|err| {
            warn!(host, error = %err, "reading configured roots failed");
            Vec::new()
        });
    roots.extend(platform::root_certificates(host).await);
    roots
}

fn configured_roots(git: &ConfigMap, os: &ConfigMap, host: &str) -> Vec<Certificate> {
    let url = format!("https://{host}/");
    let config = UrlConfig::new(git);

    let backend = config.get("http", &url, "sslbackend").unwrap_or_default();
    let schannel_uses_cainfo = config
        .get("http", &url, "schannelusesslcainfo")
        .is_some_and(|value| parse_bool(value, false));
    if backend == "schannel" && !schannel_uses_cainfo {
        return Vec::new();
    }

    if let Some(file) = os.get("GIT_SSL_CAINFO").filter(|value| !value.is_empty()) {
        return certificates_from_file(Path::new(file));
    }
    if let Some(file) = config.get("http", &url, "sslcainfo") {
        return certificates_from_file(Path::new(file));
    }
    if let Some(dir) = os.get("GIT_SSL_CAPATH").filter(|value| !value.is_empty()) {
        return certificates_from_dir(Path::new(dir));
    }
    if let Some(dir) = git.get("http.sslcapath") {
        return certificates_from_dir(Path::new(dir));
    }
    Vec::new()
}

fn certificates_from_dir(dir: &Path) -> Vec<Certificate> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "cannot read certificate directory");
            return Vec::new();
        }
    };
    let mut paths: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    paths
        .iter()
        .flat_map(|path| certificates_from_file(path))
        .collect()
}

/// Certificates in `path`, read as PEM when it has PEM armor and as DER
/// otherwise.
#[must_use]
pub fn certificates_from_file(path: &Path) -> Vec<Certificate> {
    let Some(data) = read_file(&path.to_string_lossy(), "certificate file") else {
        return Vec::new();
    };
    parse_certificates(&data).unwrap_or_else(|| {
        debug!(path = %path.display(), "no certificates found");
        Vec::new()
    })
}

pub(crate) fn parse_certificates(data: &[u8]) -> Option<Vec<Certificate>> {
    if data.is_empty() {
        return None;
    }
    if String::from_utf8_lossy(data).contains("-----BEGIN") {
        return Certificate::from_pem_bundle(data)
            .ok()
            .filter(|certs| !certs.is_empty());
    }
    Certificate::from_der(data).ok().map(|cert| vec![cert])
}

fn read_file(path: &str, what: &'static str) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Some(data),
        Err(err) => {
            debug!(path, error = %err, what, "cannot read TLS material");
            None
        }
    }
}
