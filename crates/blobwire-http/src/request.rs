//! Replayable request model.
//!
//! Bodies are held in memory so a redirect or transport retry can resend
//! them from the start.

use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use url::Url;

use crate::error::{HttpResult, TransportError, url_without_query};
use crate::json::MEDIA_TYPE;

/// An outgoing request that can be sent more than once.
#[derive(Debug, Clone)]
pub struct LfsRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    retries: Option<u32>,
}

impl LfsRequest {
    /// Request without headers or body.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            retries: None,
        }
    }

    /// Attach `body` as the request payload.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `value` as the payload and mark it as LFS JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when `value` cannot be serialized.
    pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> HttpResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|source| TransportError::EncodeBody { source })?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(MEDIA_TYPE));
        self.body = Some(body);
        Ok(self)
    }

    /// Resend up to `retries` times after a transport-level failure.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Transport retry budget; zero unless annotated.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(0)
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Target URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Mutable target URL.
    pub const fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Request headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers.
    pub const fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Payload, if any.
    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Value of header `name`, if present and valid text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Replace header `name` with `value`.
    ///
    /// # Errors
    ///
    /// Returns an error when the name or value is not valid in HTTP.
    pub fn set_header(&mut self, name: &str, value: &str) -> HttpResult<()> {
        let (name, value) = header_pair(name, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Add another value for header `name`.
    ///
    /// # Errors
    ///
    /// Returns an error when the name or value is not valid in HTTP.
    pub fn append_header(&mut self, name: &str, value: &str) -> HttpResult<()> {
        let (name, value) = header_pair(name, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Whether an `Authorization` header is present.
    #[must_use]
    pub fn has_authorization(&self) -> bool {
        self.headers.contains_key(AUTHORIZATION)
    }

    /// Follow-up request for a redirect to `location`.
    ///
    /// Keeps the method, headers, body and retry budget. `Authorization` is
    /// dropped when the host or port changes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InsecureRedirect`] for an HTTPS to HTTP
    /// transition.
    pub fn redirected_to(&self, location: Url) -> HttpResult<Self> {
        if self.url.scheme() == "https" && location.scheme() == "http" {
            return Err(TransportError::InsecureRedirect {
                from: url_without_query(&self.url),
                to: url_without_query(&location),
            });
        }

        let mut headers = self.headers.clone();
        if authority(&self.url) != authority(&location) {
            headers.remove(AUTHORIZATION);
        }
        Ok(Self {
            method: self.method.clone(),
            url: location,
            headers,
            body: self.body.clone(),
            retries: self.retries,
        })
    }
}

fn authority(url: &Url) -> (Option<&str>, Option<u16>) {
    (url.host_str(), url.port_or_known_default())
}

fn header_pair(name: &str, value: &str) -> HttpResult<(HeaderName, HeaderValue)> {
    let invalid = || TransportError::InvalidHeader {
        name: name.to_string(),
    };
    let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
    let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
    Ok((header_name, header_value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> anyhow::Result<LfsRequest> {
        let mut request = LfsRequest::new(Method::POST, Url::parse(raw)?)
            .with_body(b"{\"oid\":\"abc\"}".to_vec())
            .with_retries(2);
        request.set_header("Authorization", "Basic dXNlcjpwYXNz")?;
        request.set_header("X-Trace", "1")?;
        Ok(request)
    }

    #[test]
    fn redirect_keeps_auth_on_the_same_host() -> anyhow::Result<()> {
        let original = request("https://a.example.com/objects")?;
        let next = original.redirected_to(Url::parse("https://a.example.com:443/moved")?)?;
        assert!(next.has_authorization());
        assert_eq!(*next.method(), Method::POST);
        assert_eq!(next.body(), original.body());
        assert_eq!(next.retries(), 2);
        Ok(())
    }

    #[test]
    fn redirect_drops_auth_across_hosts_and_ports() -> anyhow::Result<()> {
        let original = request("https://a.example.com/objects")?;
        let other_host = original.redirected_to(Url::parse("https://b.example.com/objects")?)?;
        assert!(!other_host.has_authorization());
        assert_eq!(other_host.header("x-trace"), Some("1"));

        let other_port = original.redirected_to(Url::parse("https://a.example.com:8443/objects")?)?;
        assert!(!other_port.has_authorization());
        Ok(())
    }

    #[test]
    fn redirect_refuses_downgrade() -> anyhow::Result<()> {
        let original = request("https://a.example.com/objects?token=x")?;
        let err = original
            .redirected_to(Url::parse("http://a.example.com/objects")?)
            .expect_err("downgrade must fail");
        assert!(err.is_security_error());
        assert_eq!(
            err.to_string(),
            "refusing insecure redirect from https://a.example.com/objects to http://a.example.com/objects"
        );
        Ok(())
    }

    #[test]
    fn json_bodies_set_the_media_type() -> anyhow::Result<()> {
        let request = LfsRequest::new(Method::POST, Url::parse("https://example.com/locks")?)
            .with_json(&serde_json::json!({ "path": "a.bin" }))?;
        assert_eq!(request.header("content-type"), Some(MEDIA_TYPE));
        assert_eq!(request.body(), Some(br#"{"path":"a.bin"}"#.as_slice()));
        assert_eq!(request.retries(), 0);
        Ok(())
    }

    #[test]
    fn invalid_header_values_are_rejected() -> anyhow::Result<()> {
        let mut request = LfsRequest::new(Method::GET, Url::parse("https://example.com")?);
        assert!(request.set_header("X-Bad", "line\nbreak").is_err());
        request.append_header("X-Multi", "a")?;
        request.append_header("X-Multi", "b")?;
        assert_eq!(request.headers().get_all("x-multi").iter().count(), 2);
        Ok(())
    }
}
