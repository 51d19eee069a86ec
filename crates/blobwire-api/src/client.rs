//! Authenticated LFS API client.
//!
//! # Design
//! - `do_with_auth` tries once with the given access, then retries exactly
//!   once with the cached (possibly upgraded) access when the server asked
//!   for credentials and the caller had not supplied `Authorization`.
//! - Credentials come from the URL itself, then the helper chain (netrc,
//!   cache, askpass, `git credential`). They are approved on 2xx responses
//!   and rejected on auth failures.
//! - NTLM and Negotiate run the NTLMv2 exchange under their own scheme name;
//!   Basic and anonymous requests go straight to the transport.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use blobwire_config::{ConfigMap, ConfigWriter};
use blobwire_creds::creds::{PASSWORD, USERNAME};
use blobwire_creds::{CredentialHelper, CredentialHelperContext, Creds};
use blobwire_endpoint::{
    Access, AccessCache, AccessMode, Endpoint, EndpointFinder, Operation, url_without_auth,
};
use blobwire_http::{HttpClient, LfsRequest, ResponseError, SshResolver};
use blobwire_telemetry::TransferMetrics;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, Response};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ApiError, ApiResult};
use crate::ntlm::{ChallengeMessage, NEGOTIATE_MESSAGE, NtlmSessions, challenge_token};

const AUTHENTICATE_HEADERS: [&str; 2] = ["lfs-authenticate", "www-authenticate"];

/// Credentials filled for one request, with the helper that supplied them.
struct FilledCredentials {
    helper: Arc<dyn CredentialHelper>,
    creds: Creds,
}

/// LFS API client: endpoint lookup, access modes, credentials, transport.
pub struct ApiClient {
    http: HttpClient,
    endpoints: EndpointFinder,
    access: AccessCache,
    helpers: Arc<CredentialHelperContext>,
    helper_override: Option<Arc<dyn CredentialHelper>>,
    ntlm: NtlmSessions,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ApiClient")
            .field("http", &self.http)
            .field("access", &self.access)
            .field("ntlm", &self.ntlm)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Client configured from `git` and `os`, persisting access upgrades
    /// through `writer`.
    #[must_use]
    pub fn new(
        git: &ConfigMap,
        os: &ConfigMap,
        writer: Arc<dyn ConfigWriter>,
        metrics: Option<TransferMetrics>,
    ) -> Self {
        let helpers = Arc::new(CredentialHelperContext::new(git, os));
        Self {
            http: HttpClient::new(git, os, metrics).with_key_passphrases(Arc::clone(&helpers), None),
            endpoints: EndpointFinder::new(git),
            access: AccessCache::new(git, writer),
            helpers,
            helper_override: None,
            ntlm: NtlmSessions::new(),
        }
    }

    /// Use `helper` for every credential lookup instead of the default chain,
    /// client key passphrases included.
    #[must_use]
    pub fn with_credential_helper(mut self, helper: Arc<dyn CredentialHelper>) -> Self {
        self.http = self
            .http
            .with_key_passphrases(Arc::clone(&self.helpers), Some(Arc::clone(&helper)));
        self.helper_override = Some(helper);
        self
    }

    /// Replace the SSH resolver.
    #[must_use]
    pub fn with_ssh_resolver(mut self, resolver: Arc<dyn SshResolver>) -> Self {
        self.http = self.http.with_ssh_resolver(resolver);
        self
    }

    /// Underlying transport.
    #[must_use]
    pub const fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Endpoint resolver.
    #[must_use]
    pub const fn endpoints(&self) -> &EndpointFinder {
        &self.endpoints
    }

    /// Access mode cache.
    #[must_use]
    pub const fn access_cache(&self) -> &AccessCache {
        &self.access
    }

    /// LFS endpoint for `operation` against `remote`.
    #[must_use]
    pub fn endpoint(&self, operation: Operation, remote: &str) -> Endpoint {
        self.endpoints.endpoint(operation, remote)
    }

    /// Access mode currently recorded for the endpoint of `operation`.
    #[must_use]
    pub fn endpoint_access(&self, operation: Operation, remote: &str) -> Access {
        self.access.access_for(&self.endpoint(operation, remote).url)
    }

    /// Request for `suffix` under `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::new_request`].
    pub async fn new_request(
        &self,
        method: Method,
        endpoint: &Endpoint,
        suffix: &str,
    ) -> ApiResult<LfsRequest> {
        Ok(self.http.new_request(method, endpoint, suffix).await?)
    }

    /// Request for `suffix` under `endpoint` with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::new_json_request`].
    pub async fn new_json_request<T: Serialize + ?Sized + Sync>(
        &self,
        method: Method,
        endpoint: &Endpoint,
        suffix: &str,
        body: &T,
    ) -> ApiResult<LfsRequest> {
        Ok(self
            .http
            .new_json_request(method, endpoint, suffix, body)
            .await?)
    }

    /// Send `request` without credential handling.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::do_request`].
    pub async fn do_request(&self, request: LfsRequest) -> ApiResult<Response> {
        Ok(self.http.do_request(request).await?)
    }

    /// Send `request` to `remote`'s API with credentials for `access`.
    ///
    /// # Errors
    ///
    /// Returns credential lookup failures, NTLM failures, and the transport
    /// error of the final attempt.
    pub async fn do_with_auth(
        &self,
        remote: &str,
        access: &Access,
        mut request: LfsRequest,
    ) -> ApiResult<Response> {
        self.http.apply_extra_headers(&mut request);
        let retry = (!request.has_authorization()).then(|| request.clone());

        match self.attempt(remote, access, request).await {
            Err(err) if err.is_auth_error() => {
                let Some(request) = retry else {
                    return Err(err);
                };
                let upgraded = self.access.access_for(access.url());
                info!(
                    mode = %upgraded.mode(),
                    url = %upgraded.url(),
                    "http response indicates authentication, resubmitting"
                );
                self.attempt(remote, &upgraded, request).await
            }
            result => result,
        }
    }

    async fn attempt(
        &self,
        remote: &str,
        access: &Access,
        mut request: LfsRequest,
    ) -> ApiResult<Response> {
        let filled = self.fill_credentials(remote, access, &mut request).await?;
        let (result, rejected) = match (access.mode(), &filled) {
            (AccessMode::Ntlm | AccessMode::Negotiate, Some(filled)) => {
                (self.do_with_ntlm(request, access.mode(), filled).await, true)
            }
            (mode, _) => (Ok(self.http.do_with_access(request, mode).await?), false),
        };

        match &result {
            Ok(response) if response.status().is_success() => {
                if let Some(filled) = &filled {
                    approve(filled).await;
                }
            }
            Err(err) if err.is_auth_error() => {
                if let Some(response) = err.response() {
                    self.upgrade_access(access, response).await;
                }
                if !rejected && let Some(filled) = &filled {
                    reject(filled).await;
                }
            }
            _ => {}
        }
        result
    }

    async fn fill_credentials(
        &self,
        remote: &str,
        access: &Access,
        request: &mut LfsRequest,
    ) -> ApiResult<Option<FilledCredentials>> {
        let operation = Operation::from_method(request.method().as_str());
        let endpoint = self.endpoints.endpoint(operation, remote);
        let api_url = parse_url(&endpoint.url)?;

        if matches!(access.mode(), AccessMode::Ntlm | AccessMode::Negotiate) {
            return self.fill(&api_url).await.map(Some);
        }
        if request_has_auth(request) || access.mode() == AccessMode::None {
            return Ok(None);
        }

        let Some(url) = self.credentials_url(operation, remote, &api_url, request)? else {
            return Ok(None);
        };
        let filled = self.fill(&url).await?;
        debug!(url = %url_without_auth(url.as_str()), "filled credentials");
        set_basic_auth(
            request,
            filled.creds.first(USERNAME),
            filled.creds.first(PASSWORD),
        )?;
        Ok(Some(filled))
    }

    /// URL to look credentials up for, or `None` when the request was
    /// authorized from URL userinfo.
    fn credentials_url(
        &self,
        operation: Operation,
        remote: &str,
        api_url: &Url,
        request: &mut LfsRequest,
    ) -> ApiResult<Option<Url>> {
        if !same_origin(request.url(), api_url) {
            return Ok(Some(request.url().clone()));
        }
        if set_auth_from_url(request, api_url)? {
            return Ok(None);
        }

        if !remote.is_empty()
            && let Some(raw) = self
                .endpoints
                .git_remote_url(remote, operation == Operation::Upload)
            && let Ok(remote_url) = Url::parse(&raw)
            && same_origin(&remote_url, api_url)
        {
            if set_auth_from_url(request, &remote_url)? {
                return Ok(None);
            }
            return Ok(Some(remote_url));
        }
        Ok(Some(api_url.clone()))
    }

    async fn fill(&self, url: &Url) -> ApiResult<FilledCredentials> {
        let selection = self.helpers.select(url);
        let helper = self
            .helper_override
            .clone()
            .unwrap_or(selection.helper);
        let not_found = |source| ApiError::CredentialsNotFound {
            url: url_without_auth(url.as_str()),
            source,
        };
        match helper.fill(&selection.input).await {
            Ok(Some(creds)) if !creds.is_empty() => Ok(FilledCredentials { helper, creds }),
            Ok(_) => Err(not_found(None)),
            Err(err) => Err(not_found(Some(err))),
        }
    }

    async fn upgrade_access(&self, access: &Access, response: &ResponseError) {
        let mode = challenged_mode(response);
        if mode == access.mode() {
            return;
        }
        if let Some(metrics) = self.http.metrics() {
            metrics.inc_access_upgrade(mode.as_str());
        }
        if let Err(err) = self.access.set_access(&access.upgrade(mode)).await {
            warn!(url = %access.url(), mode = %mode, error = %err, "failed to persist access mode");
        }
    }

    /// NTLM or Negotiate exchange for `request`; rejects `filled` at most
    /// once, on a 401 or 403 from the exchange.
    async fn do_with_ntlm(
        &self,
        request: LfsRequest,
        mode: AccessMode,
        filled: &FilledCredentials,
    ) -> ApiResult<Response> {
        match self.http.do_with_access(request.clone(), mode).await {
            Err(err) if err.is_auth_error() => {}
            result => return Ok(result?),
        }

        let mut rejected = false;
        loop {
            let result = self.ntlm_exchange(&request, mode, &filled.creds).await;
            let status = result.as_ref().err().and_then(ApiError::status);
            if matches!(status, Some(401 | 403)) && !rejected {
                reject(filled).await;
                rejected = true;
                if status == Some(401) {
                    continue;
                }
            }
            return result;
        }
    }

    async fn ntlm_exchange(
        &self,
        request: &LfsRequest,
        mode: AccessMode,
        creds: &Creds,
    ) -> ApiResult<Response> {
        let scheme = if mode == AccessMode::Negotiate {
            "Negotiate"
        } else {
            "NTLM"
        };

        let mut negotiate = request.clone();
        negotiate.set_header(AUTHORIZATION.as_str(), &format!("{scheme} {NEGOTIATE_MESSAGE}"))?;
        let header = match self.http.do_with_access(negotiate, mode).await {
            Ok(response) => return Ok(response),
            Err(err) if err.is_auth_error() => err.response().map(challenge_header).unwrap_or_default(),
            Err(err) => return Err(err.into()),
        };

        let challenge = ChallengeMessage::from_base64(challenge_token(&header)?)?;
        let session = self.ntlm.session_for(creds)?;
        let message = session.authenticate(&challenge)?;
        debug!(domain = %session.domain(), scheme, "answering NTLM challenge");

        let mut authenticate = request.clone();
        authenticate.set_header(AUTHORIZATION.as_str(), &format!("{scheme} {message}"))?;
        Ok(self.http.do_with_access(authenticate, mode).await?)
    }
}

/// Access mode named by the first NTLM or Negotiate challenge, else Basic.
#[must_use]
pub fn challenged_mode(response: &ResponseError) -> AccessMode {
    AUTHENTICATE_HEADERS
        .iter()
        .flat_map(|name| response.headers.get_all(*name))
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            let scheme = value.split_whitespace().next()?.to_ascii_lowercase();
            match scheme.as_str() {
                "negotiate" => Some(AccessMode::Negotiate),
                "ntlm" => Some(AccessMode::Ntlm),
                _ => None,
            }
        })
        .unwrap_or(AccessMode::Basic)
}

fn challenge_header(response: &ResponseError) -> String {
    let mut values = response
        .headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok());
    let first = values.next().unwrap_or_default();
    if first.trim().contains(' ') {
        return first.to_string();
    }
    values
        .find(|value| value.trim().contains(' '))
        .unwrap_or(first)
        .to_string()
}

fn request_has_auth(request: &LfsRequest) -> bool {
    request.has_authorization()
        || request
            .url()
            .query_pairs()
            .any(|(key, value)| key == "token" && !value.is_empty())
}

fn set_auth_from_url(request: &mut LfsRequest, url: &Url) -> ApiResult<bool> {
    let Some(password) = url.password() else {
        return Ok(false);
    };
    warn!("current Git remote contains credentials");
    set_basic_auth(request, &decode(url.username()), &decode(password))?;
    Ok(true)
}

fn set_basic_auth(request: &mut LfsRequest, user: &str, password: &str) -> ApiResult<()> {
    if user.is_empty() && password.is_empty() {
        return Ok(());
    }
    let token = STANDARD.encode(format!("{user}:{password}"));
    request.set_header(AUTHORIZATION.as_str(), &format!("Basic {token}"))?;
    Ok(())
}

fn same_origin(left: &Url, right: &Url) -> bool {
    left.scheme() == right.scheme() && left.host_str() == right.host_str() && left.port() == right.port()
}

fn parse_url(raw: &str) -> ApiResult<Url> {
    Url::parse(raw).map_err(|source| ApiError::InvalidUrl {
        url: url_without_auth(raw),
        source,
    })
}

fn decode(value: &str) -> String {
    urlencoding::decode(value).map_or_else(|_| value.to_string(), std::borrow::Cow::into_owned)
}

async fn approve(filled: &FilledCredentials) {
    if let Err(err) = filled.helper.approve(&filled.creds).await {
        warn!(error = %err, "failed to approve credentials");
    }
}

async fn reject(filled: &FilledCredentials) {
    if let Err(err) = filled.helper.reject(&filled.creds).await {
        warn!(error = %err, "failed to reject credentials");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn response_with(headers: &[(&'static str, &'static str)]) -> anyhow::Result<ResponseError> {
        let mut map = HeaderMap::new();
        for &(name, value) in headers {
            map.append(name, HeaderValue::from_static(value));
        }
        Ok(ResponseError::new(
            401,
            "POST",
            &Url::parse("https://git.example.com/repo/info/lfs/objects/batch")?,
            map,
        ))
    }

    #[test]
    fn challenges_pick_the_access_mode() -> anyhow::Result<()> {
        assert_eq!(challenged_mode(&response_with(&[])?), AccessMode::Basic);
        assert_eq!(
            challenged_mode(&response_with(&[("www-authenticate", "Basic realm=\"x\"")])?),
            AccessMode::Basic
        );
        assert_eq!(
            challenged_mode(&response_with(&[("www-authenticate", "NTLM")])?),
            AccessMode::Ntlm
        );
        assert_eq!(
            challenged_mode(&response_with(&[
                ("www-authenticate", "Basic realm=\"x\""),
                ("www-authenticate", "Negotiate"),
            ])?),
            AccessMode::Negotiate
        );
        assert_eq!(
            challenged_mode(&response_with(&[
                ("lfs-authenticate", "ntlm"),
                ("www-authenticate", "Negotiate"),
            ])?),
            AccessMode::Ntlm
        );
        Ok(())
    }

    #[test]
    fn challenge_header_prefers_values_with_tokens() -> anyhow::Result<()> {
        let response = response_with(&[
            ("www-authenticate", "Negotiate"),
            ("www-authenticate", "NTLM abc="),
        ])?;
        assert_eq!(challenge_header(&response), "NTLM abc=");
        assert_eq!(challenge_header(&response_with(&[])?), "");
        Ok(())
    }

    #[test]
    fn token_query_counts_as_auth() -> anyhow::Result<()> {
        let request = LfsRequest::new(Method::GET, Url::parse("https://h/x?token=abc")?);
        assert!(request_has_auth(&request));
        let request = LfsRequest::new(Method::GET, Url::parse("https://h/x?token=")?);
        assert!(!request_has_auth(&request));
        Ok(())
    }

    #[test]
    fn url_credentials_become_basic_auth() -> anyhow::Result<()> {
        let mut request = LfsRequest::new(Method::GET, Url::parse("https://h/x")?);
        assert!(!set_auth_from_url(&mut request, &Url::parse("https://user@h/x")?)?);
        assert!(!request.has_authorization());

        assert!(set_auth_from_url(
            &mut request,
            &Url::parse("https://user:p%40ss@h/x")?
        )?);
        assert_eq!(
            request.header("authorization"),
            Some(format!("Basic {}", STANDARD.encode("user:p@ss")).as_str())
        );
        Ok(())
    }

    #[test]
    fn empty_credentials_leave_the_request_alone() -> anyhow::Result<()> {
        let mut request = LfsRequest::new(Method::GET, Url::parse("https://h/x")?);
        set_basic_auth(&mut request, "", "")?;
        assert!(!request.has_authorization());
        Ok(())
    }

    #[test]
    fn origins_compare_scheme_host_and_port() -> anyhow::Result<()> {
        let api = Url::parse("https://git.example.com/repo.git/info/lfs")?;
        assert!(same_origin(&Url::parse("https://git.example.com/other")?, &api));
        assert!(same_origin(&Url::parse("https://git.example.com:443/other")?, &api));
        assert!(!same_origin(&Url::parse("http://git.example.com/other")?, &api));
        assert!(!same_origin(&Url::parse("https://git.example.com:8443/other")?, &api));
        assert!(!same_origin(&Url::parse("https://lfs.example.com/other")?, &api));
        Ok(())
    }
}
