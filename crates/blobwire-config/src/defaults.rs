//! Default values for transport settings.
//!
//! # Design
//! - Keep timeouts and retry counts in one place so settings and docs agree.

/// Default TCP connect timeout in seconds.
pub(crate) const DIAL_TIMEOUT_SECS: u64 = 30;
/// Default TCP keepalive interval in seconds.
pub(crate) const KEEPALIVE_SECS: u64 = 1800;
/// Default TLS handshake timeout in seconds.
pub(crate) const TLS_TIMEOUT_SECS: u64 = 30;
/// Default per-connection activity timeout in seconds.
pub(crate) const ACTIVITY_TIMEOUT_SECS: u64 = 30;
/// Default number of concurrent transfers, used to size idle connection pools.
pub(crate) const CONCURRENT_TRANSFERS: usize = 8;
/// Default number of SSH bridge retries after the first attempt.
pub(crate) const SSH_RETRIES: u32 = 5;
/// Substitute protocol applied to `git://` remotes.
pub(crate) const GIT_PROTOCOL: &str = "https";
