//! Request and response header dumps.
//!
//! `GIT_CURL_VERBOSE` turns the dumps on. Credentials in `Authorization` and
//! `Proxy-Authorization` are masked down to their scheme unless
//! `LFS_DEBUG_HTTP` is also set, which additionally dumps request bodies.

use blobwire_config::ConfigMap;
use reqwest::Response;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, PROXY_AUTHORIZATION};
use tracing::debug;

use crate::error::url_without_query;
use crate::request::LfsRequest;

const MASK: &str = "* * * * *";

/// Verbose dump switches read from the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpDump {
    enabled: bool,
    reveal: bool,
}

impl HttpDump {
    /// Switches from `GIT_CURL_VERBOSE` and `LFS_DEBUG_HTTP` in `os`.
    #[must_use]
    pub fn from_env(os: &ConfigMap) -> Self {
        Self {
            enabled: os.bool("GIT_CURL_VERBOSE", false),
            reveal: os.bool("LFS_DEBUG_HTTP", false),
        }
    }

    /// Whether dumps are emitted at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn request(&self, request: &LfsRequest) {
        if !self.enabled {
            return;
        }
        debug!(
            method = %request.method(),
            url = %url_without_query(request.url()),
            headers = ?header_lines(request.headers(), self.reveal),
            "> request"
        );
        if self.reveal
            && let Some(body) = request.body()
        {
            debug!(body = %String::from_utf8_lossy(body), "> request body");
        }
    }

    pub(crate) fn response(&self, request: &LfsRequest, response: &Response) {
        if !self.enabled {
            return;
        }
        debug!(
            url = %url_without_query(request.url()),
            version = ?response.version(),
            status = response.status().as_u16(),
            headers = ?header_lines(response.headers(), self.reveal),
            "< response"
        );
    }
}

/// `name: value` lines for `headers`, with credentials masked unless
/// `reveal`.
#[must_use]
pub fn header_lines(headers: &HeaderMap, reveal: bool) -> Vec<String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes());
            if reveal || !is_credential(name) {
                return format!("{name}: {value}");
            }
            match value.split_once(' ') {
                Some((scheme, _)) => format!("{name}: {scheme} {MASK}"),
                None => format!("{name}: {MASK}"),
            }
        })
        .collect()
}

fn is_credential(name: &HeaderName) -> bool {
    *name == AUTHORIZATION || *name == PROXY_AUTHORIZATION
}

#[cfg(test)]
mod tests {
    use reqwest::header::{ACCEPT, HeaderValue};

    use super::*;

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("opaque"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.git-lfs+json"));
        headers
    }

    #[test]
    fn credentials_are_masked_by_default() {
        let lines = header_lines(&headers(), false);
        assert!(lines.contains(&"authorization: Basic * * * * *".to_string()));
        assert!(lines.contains(&"proxy-authorization: * * * * *".to_string()));
        assert!(lines.contains(&"accept: application/vnd.git-lfs+json".to_string()));
        assert!(!lines.iter().any(|line| line.contains("dXNlcjpwYXNz")));
    }

    #[test]
    fn debug_http_reveals_credentials() {
        let lines = header_lines(&headers(), true);
        assert!(lines.contains(&"authorization: Basic dXNlcjpwYXNz".to_string()));
    }

    #[test]
    fn switches_come_from_the_environment() {
        assert!(!HttpDump::from_env(&ConfigMap::environment_from_pairs([("HOME", "/tmp")])).is_enabled());
        let dump = HttpDump::from_env(&ConfigMap::environment_from_pairs([
            ("GIT_CURL_VERBOSE", "1"),
            ("LFS_DEBUG_HTTP", "true"),
        ]));
        assert_eq!(
            dump,
            HttpDump {
                enabled: true,
                reveal: true
            }
        );
    }
}
