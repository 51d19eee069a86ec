//! JSON bodies in the LFS media type.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Response;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;

use crate::error::{HttpResult, TransportError};

/// Media type of LFS API requests and responses.
pub const MEDIA_TYPE: &str = "application/vnd.git-lfs+json; charset=utf-8";

static JSON_MEDIA_TYPE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)\Aapplication/(vnd\.git-lfs\+)?json(\s*;|\z)").ok()
});

/// Whether `content_type` names the LFS JSON type or plain JSON.
#[must_use]
pub fn is_json_media_type(content_type: &str) -> bool {
    JSON_MEDIA_TYPE
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(content_type.trim()))
}

/// Decode a JSON response body into `T`.
///
/// # Errors
///
/// Returns [`TransportError::DecodeType`] for non-JSON media types, and read
/// or decode errors for the body itself.
pub async fn decode_json<T: DeserializeOwned>(response: Response) -> HttpResult<T> {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !is_json_media_type(&content_type) {
        return Err(TransportError::DecodeType { content_type });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|source| TransportError::ReadBody { source })?;
    serde_json::from_slice(&bytes).map_err(|source| TransportError::Decode { source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq, Eq)]
    struct Lock {
        id: String,
    }

    #[test]
    fn media_types_are_matched_on_type_only() {
        assert!(is_json_media_type(MEDIA_TYPE));
        assert!(is_json_media_type("application/vnd.git-lfs+json"));
        assert!(is_json_media_type("Application/JSON ; charset=utf-8"));
        assert!(!is_json_media_type("application/jsonp"));
        assert!(!is_json_media_type("text/html"));
        assert!(!is_json_media_type(""));
    }

    #[tokio::test]
    async fn decode_json_checks_content_type() -> anyhow::Result<()> {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/lock");
            then.status(200)
                .header("content-type", MEDIA_TYPE)
                .body(r#"{"id":"l1"}"#);
        });
        server.mock(|when, then| {
            when.method(GET).path("/html");
            then.status(200)
                .header("content-type", "text/html")
                .body("<html></html>");
        });

        let lock: Lock = decode_json(reqwest::get(server.url("/lock")).await?).await?;
        assert_eq!(lock, Lock { id: "l1".to_string() });

        let err = decode_json::<Lock>(reqwest::get(server.url("/html")).await?)
            .await
            .expect_err("html is not json");
        assert!(matches!(err, TransportError::DecodeType { content_type } if content_type == "text/html"));
        Ok(())
    }
}
