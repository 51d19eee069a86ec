#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! HTTP transport for LFS API requests.
//!
//! Layout: `request.rs` (replayable request), `client.rs` (construction,
//! redirects, retries), `classify.rs` (status to error mapping), `transport.rs`
//! (per-host clients), `certs.rs`/`platform.rs` (TLS material), `proxy.rs`
//! (proxy selection), `keys.rs` (encrypted client keys), `ssh.rs`
//! (`git-lfs-authenticate` bridge), `json.rs` (LFS media type), `verbose.rs`
//! (`GIT_CURL_VERBOSE` header dumps).

pub mod certs;
pub mod classify;
pub mod client;
pub mod error;
pub mod json;
pub mod keys;
pub mod proxy;
pub mod request;
pub mod ssh;
pub mod transport;
pub mod verbose;

mod platform;

pub use certs::KeyPassphrases;
pub use classify::{classify_response, classify_status, parse_retry_after};
pub use client::{HttpClient, MAX_REDIRECTS, USER_AGENT, join_url};
pub use error::{
    HttpResult, KeyError, KeyResult, ResponseError, SshError, SshResult, TransportError, url_without_query,
};
pub use json::{MEDIA_TYPE, decode_json, is_json_media_type};
pub use keys::{decrypt_private_key, is_encrypted};
pub use proxy::{ProxyResolver, use_proxy};
pub use request::LfsRequest;
pub use ssh::{
    EXPIRY_LOOKAHEAD, SshAuthClient, SshAuthResponse, SshCache, SshResolver, quoted_fields,
    ssh_command,
};
pub use transport::{HostClientCache, HttpVersion, authority, http_version};
pub use verbose::{HttpDump, header_lines};
