//! Request construction and execution.
//!
//! # Design
//! - `new_request` resolves SSH credentials before building the URL, so an
//!   SSH `href` replaces the endpoint URL and SSH headers travel with the
//!   request.
//! - `do_with_access` sends through the per-host client for the access mode,
//!   retries transport failures up to the request's budget, fails on the
//!   [`MAX_REDIRECTS`]th redirect response, then classifies the final status.
//! - Only `do_request` adds `http.<url>.extraheader` values; authenticated
//!   callers add them once before their own retries.
//! - With `GIT_CURL_VERBOSE` set, every attempt's request and response
//!   headers are dumped at debug level (see [`crate::verbose`]).

use std::sync::Arc;
use std::time::Instant;

use blobwire_config::{ConfigMap, TransportSettings, UrlConfig};
use blobwire_creds::{CredentialHelper, CredentialHelperContext};
use blobwire_endpoint::{AccessMode, Endpoint};
use blobwire_telemetry::TransferMetrics;
use once_cell::sync::Lazy;
use reqwest::header::{ACCEPT, LOCATION};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::certs::KeyPassphrases;
use crate::classify::classify_response;
use crate::error::{HttpResult, TransportError, url_without_query};
use crate::json::MEDIA_TYPE;
use crate::request::LfsRequest;
use crate::ssh::{SshAuthClient, SshAuthResponse, SshCache, SshResolver};
use crate::transport::HostClientCache;
use crate::verbose::HttpDump;

/// Redirect responses in one chain that end it with an error; at most
/// `MAX_REDIRECTS - 1` are followed.
pub const MAX_REDIRECTS: usize = 3;

/// `User-Agent` sent with every request.
pub static USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "git-lfs/{} (blobwire; {} {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

/// Shared HTTP transport for LFS API requests.
pub struct HttpClient {
    git: ConfigMap,
    os: ConfigMap,
    clients: HostClientCache,
    ssh: Arc<dyn SshResolver>,
    ssh_retries: u32,
    dump: HttpDump,
    metrics: Option<TransferMetrics>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("clients", &self.clients)
            .field("ssh_retries", &self.ssh_retries)
            .field("dump", &self.dump)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Client configured from `git` and `os`, recording into `metrics` when
    /// given.
    ///
    /// SSH tokens are cached unless `lfs.cachecredentials` is false.
    #[must_use]
    pub fn new(git: &ConfigMap, os: &ConfigMap, metrics: Option<TransferMetrics>) -> Self {
        let settings = TransportSettings::from_config(git, os);
        let resolver: Arc<dyn SshResolver> = Arc::new(SshAuthClient::new(git, os));
        let ssh: Arc<dyn SshResolver> = if settings.cache_credentials {
            Arc::new(SshCache::new(resolver, metrics.clone()))
        } else {
            resolver
        };
        Self {
            git: git.clone(),
            os: os.clone(),
            clients: HostClientCache::new(git, os, USER_AGENT.as_str()),
            ssh,
            ssh_retries: settings.ssh_retries,
            dump: HttpDump::from_env(os),
            metrics,
        }
    }

    /// Ask the helpers of `context`, or `helper` when given, for client key
    /// passphrases.
    #[must_use]
    pub fn with_key_passphrases(
        mut self,
        context: Arc<CredentialHelperContext>,
        helper: Option<Arc<dyn CredentialHelper>>,
    ) -> Self {
        self.clients = self
            .clients
            .with_key_passphrases(KeyPassphrases::new(context, helper));
        self
    }

    /// Replace the SSH resolver.
    #[must_use]
    pub fn with_ssh_resolver(mut self, resolver: Arc<dyn SshResolver>) -> Self {
        self.ssh = resolver;
        self
    }

    /// Git configuration snapshot.
    #[must_use]
    pub const fn git(&self) -> &ConfigMap {
        &self.git
    }

    /// OS environment snapshot.
    #[must_use]
    pub const fn os(&self) -> &ConfigMap {
        &self.os
    }

    /// Metrics handle, if recording is enabled.
    #[must_use]
    pub const fn metrics(&self) -> Option<&TransferMetrics> {
        self.metrics.as_ref()
    }

    /// Per-host client cache.
    #[must_use]
    pub const fn clients(&self) -> &HostClientCache {
        &self.clients
    }

    /// Request for `suffix` under `endpoint`, with SSH credentials applied.
    ///
    /// # Errors
    ///
    /// Returns an error when SSH resolution fails, the resolved URL is not
    /// HTTP(S), or a header from the SSH response is invalid.
    pub async fn new_request(
        &self,
        method: Method,
        endpoint: &Endpoint,
        suffix: &str,
    ) -> HttpResult<LfsRequest> {
        if endpoint.url.starts_with("file://") {
            warn!(
                url = %endpoint.url,
                "file:// URLs are only supported with a standalone transfer agent"
            );
        }

        let ssh = self
            .ssh_resolve_with_retries(endpoint, method.as_str())
            .await?;
        let prefix = if ssh.href.is_empty() {
            endpoint.url.as_str()
        } else {
            ssh.href.as_str()
        };
        let lower = prefix.to_ascii_lowercase();
        if !lower.starts_with("http://") && !lower.starts_with("https://") {
            return Err(TransportError::MissingProtocol {
                url: prefix.split('?').next().unwrap_or_default().to_string(),
            });
        }

        let joined = join_url(prefix, suffix);
        let url = Url::parse(&joined).map_err(|source| TransportError::InvalidUrl {
            url: joined.clone(),
            source,
        })?;
        let mut request = LfsRequest::new(method, url);
        for (name, value) in &ssh.header {
            request.set_header(name, value)?;
        }
        request.set_header(ACCEPT.as_str(), MEDIA_TYPE)?;
        Ok(request)
    }

    /// [`new_request`](Self::new_request) with `body` encoded as LFS JSON.
    ///
    /// # Errors
    ///
    /// Returns the errors of `new_request` and body encoding failures.
    pub async fn new_json_request<T: Serialize + ?Sized + Sync>(
        &self,
        method: Method,
        endpoint: &Endpoint,
        suffix: &str,
        body: &T,
    ) -> HttpResult<LfsRequest> {
        self.new_request(method, endpoint, suffix)
            .await?
            .with_json(body)
    }

    /// Append the `http.<url>.extraheader` values that apply to `request`.
    ///
    /// Malformed entries are logged and skipped.
    pub fn apply_extra_headers(&self, request: &mut LfsRequest) {
        let url = request.url().to_string();
        for raw in UrlConfig::new(&self.git).get_all("http", &url, "extraheader") {
            let Some((name, value)) = raw.split_once(':') else {
                warn!(header = %raw, "ignoring malformed extra header");
                continue;
            };
            if let Err(err) = request.append_header(name.trim(), value.trim()) {
                warn!(header = %name.trim(), error = %err, "ignoring invalid extra header");
            }
        }
    }

    /// Send `request` anonymously with extra headers applied.
    ///
    /// # Errors
    ///
    /// Returns transport, redirect, and status-classified errors.
    pub async fn do_request(&self, mut request: LfsRequest) -> HttpResult<Response> {
        self.apply_extra_headers(&mut request);
        self.do_with_access(request, AccessMode::None).await
    }

    /// Send `request` through the client for `mode`, following redirects.
    ///
    /// # Errors
    ///
    /// Returns transport errors after the retry budget, redirect errors, and
    /// status-classified errors for statuses of 400 and above.
    pub async fn do_with_access(&self, request: LfsRequest, mode: AccessMode) -> HttpResult<Response> {
        let started = Instant::now();
        let mut request = request;
        let mut redirects = 0;
        loop {
            let response = self.send_with_retries(&request, mode).await?;
            let status = response.status();
            if let Some(metrics) = &self.metrics {
                metrics.inc_http_request(request.method().as_str(), status.as_u16());
            }
            debug!(
                method = %request.method(),
                url = %url_without_query(request.url()),
                status = status.as_u16(),
                "http response"
            );

            if !is_redirect(status) {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_request_duration(started.elapsed());
                }
                return classify_response(request.method().as_str(), request.url(), response).await;
            }

            redirects += 1;
            if redirects >= MAX_REDIRECTS {
                return Err(TransportError::TooManyRedirects {
                    method: request.method().to_string(),
                    url: url_without_query(request.url()),
                });
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let invalid = || TransportError::InvalidRedirect {
                url: url_without_query(request.url()),
                location: location.clone(),
            };
            if location.is_empty() {
                return Err(invalid());
            }
            let target = request.url().join(&location).map_err(|_| invalid())?;
            debug!(
                from = %url_without_query(request.url()),
                to = %url_without_query(&target),
                status = status.as_u16(),
                "following redirect"
            );
            request = request.redirected_to(target)?;
            if let Some(metrics) = &self.metrics {
                metrics.inc_redirect();
            }
        }
    }

    async fn send_with_retries(&self, request: &LfsRequest, mode: AccessMode) -> HttpResult<Response> {
        let client = self.clients.client_for(request.url(), mode).await?;
        let budget = request.retries();
        let mut attempt = 0;
        loop {
            let mut builder = client
                .request(request.method().clone(), request.url().clone())
                .headers(request.headers().clone());
            if let Some(body) = request.body() {
                builder = builder.body(body.to_vec());
            }
            self.dump.request(request);
            match builder.send().await {
                Ok(response) => {
                    self.dump.response(request, &response);
                    return Ok(response);
                }
                Err(err) if attempt < budget => {
                    attempt += 1;
                    warn!(
                        method = %request.method(),
                        url = %url_without_query(request.url()),
                        attempt,
                        budget,
                        error = %err,
                        "retrying after transport error"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_transport_retry();
                    }
                }
                Err(source) => {
                    return Err(TransportError::Send {
                        method: request.method().to_string(),
                        url: url_without_query(request.url()),
                        source,
                    });
                }
            }
        }
    }

    async fn ssh_resolve_with_retries(&self, endpoint: &Endpoint, method: &str) -> HttpResult<SshAuthResponse> {
        if !endpoint.ssh.is_present() {
            return Ok(SshAuthResponse::default());
        }

        let tries = self.ssh_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ssh.resolve(endpoint, method).await {
                Ok(response) => {
                    self.record_ssh("resolved");
                    return Ok(response);
                }
                Err(err) if attempt < tries => {
                    warn!(
                        user_and_host = %endpoint.ssh.user_and_host,
                        attempt,
                        tries,
                        error = %err,
                        "ssh: failed to resolve credentials, retrying"
                    );
                }
                Err(source) => {
                    self.record_ssh("failed");
                    return Err(TransportError::Ssh {
                        user_and_host: endpoint.ssh.user_and_host.clone(),
                        source,
                    });
                }
            }
        }
    }

    fn record_ssh(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_ssh_resolution(outcome);
        }
    }
}

const fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// `prefix` and `suffix` joined by exactly one slash.
#[must_use]
pub fn join_url(prefix: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return prefix.to_string();
    }
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        suffix.trim_start_matches('/')
    )
}
