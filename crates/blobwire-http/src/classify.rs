//! Mapping of final HTTP statuses onto [`TransportError`] variants.
//!
//! # Design
//! - Statuses below 400 pass through untouched.
//! - A body served as JSON with a non-empty `message` replaces the default
//!   text. Other media types, unreadable and malformed bodies fall back to
//!   the per-status template.
//! - 401 is an auth error, 422 unprocessable, 429 retry-later. 501, 507 and
//!   509 signal temporary capacity limits; every other 5xx is fatal.

use chrono::{DateTime, Utc};
use reqwest::Response;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use url::Url;

use crate::error::{HttpResult, ResponseError, TransportError};
use crate::json::is_json_media_type;

#[derive(Debug, Default, Deserialize)]
struct ServerMessage {
    #[serde(default)]
    message: String,
    #[serde(default)]
    documentation_url: String,
    #[serde(default)]
    request_id: String,
}

/// Pass through `response` when successful, otherwise read its body and
/// classify it.
///
/// # Errors
///
/// Returns the classified error for any status of 400 or above.
pub async fn classify_response(method: &str, url: &Url, response: Response) -> HttpResult<Response> {
    let status = response.status().as_u16();
    if status < 400 {
        return Ok(response);
    }

    let headers = response.headers().clone();
    let body = response.bytes().await.unwrap_or_default();
    let mut error = ResponseError::new(status, method, url, headers.clone());
    if let Some(server) = server_message(&headers, &body) {
        error.message = non_empty(server.message);
        if error.message.is_some() {
            error.documentation_url = non_empty(server.documentation_url);
            error.request_id = non_empty(server.request_id);
        }
    }
    Err(classify_status(error, Utc::now()))
}

fn server_message(headers: &HeaderMap, body: &[u8]) -> Option<ServerMessage> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !is_json_media_type(content_type) {
        return None;
    }
    serde_json::from_slice(body).ok()
}

/// Wrap `error` in the variant its status calls for.
#[must_use]
pub fn classify_status(error: ResponseError, now: DateTime<Utc>) -> TransportError {
    let response = Box::new(error);
    match response.status {
        401 => TransportError::Auth { response },
        422 => TransportError::Unprocessable { response },
        429 => {
            let retry_at = response
                .header(RETRY_AFTER.as_str())
                .and_then(|value| parse_retry_after(value, now));
            TransportError::RetryLater { response, retry_at }
        }
        501 | 507 | 509 => TransportError::Retriable { response },
        status if status >= 500 => TransportError::Fatal { response },
        _ => TransportError::Client { response },
    }
}

/// Instant named by a `Retry-After` value: delay-seconds or an HTTP date.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u32>() {
        return Some(now + chrono::Duration::seconds(i64::from(seconds)));
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}
