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

//! Authenticated access to LFS API endpoints.
//!
//! Layout: `client.rs` (credential resolution, access upgrades, retries),
//! `ntlm.rs` (NTLMv2 messages and per-domain sessions), `error.rs`.

pub mod client;
pub mod error;
pub mod ntlm;

pub use client::{ApiClient, challenged_mode};
pub use error::{ApiError, ApiResult};
pub use ntlm::{ChallengeMessage, NEGOTIATE_MESSAGE, NtlmSession, NtlmSessions};
