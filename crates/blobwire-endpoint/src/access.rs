//! Per-URL memory of the authentication scheme a server requires.
//!
//! # Design
//! - Keys are URLs with any userinfo removed.
//! - The first lookup for a URL reads `lfs.<url>.access`; later lookups are
//!   served from memory. `private` is read as `basic`.
//! - Writes update memory before persisting, so a failed write still
//!   upgrades the running process. Concurrent writers converge on the last
//!   write.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use blobwire_config::{ConfigMap, ConfigWriter, UrlConfig};
use tracing::debug;

use crate::error::{EndpointError, EndpointResult};

/// Authentication scheme a server expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Anonymous access; no credential work happens.
    #[default]
    None,
    /// HTTP Basic.
    Basic,
    /// NTLM challenge/response.
    Ntlm,
    /// SPNEGO `Negotiate` challenge/response.
    Negotiate,
}

impl AccessMode {
    /// Configuration spelling of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Ntlm => "ntlm",
            Self::Negotiate => "negotiate",
        }
    }

    /// Parse a configured mode, case-insensitively.
    ///
    /// Empty and `none` mean anonymous; `private` and unrecognised values
    /// mean Basic.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Self::None,
            "ntlm" => Self::Ntlm,
            "negotiate" => Self::Negotiate,
            _ => Self::Basic,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// An access mode bound to the normalized URL it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Access {
    mode: AccessMode,
    url: String,
}

impl Access {
    /// Bind `mode` to `url`.
    #[must_use]
    pub fn new(mode: AccessMode, url: impl Into<String>) -> Self {
        Self {
            mode,
            url: url.into(),
        }
    }

    /// Scheme in effect.
    #[must_use]
    pub const fn mode(&self) -> AccessMode {
        self.mode
    }

    /// URL the mode applies to, without userinfo.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Same URL with a different mode.
    #[must_use]
    pub fn upgrade(&self, mode: AccessMode) -> Self {
        Self::new(mode, self.url.clone())
    }
}

/// Remove `user[:password]@` from the authority of `raw`.
///
/// Strings that are not `scheme://` URLs are returned unchanged.
#[must_use]
pub fn url_without_auth(raw: &str) -> String {
    if !raw.contains('@') {
        return raw.to_string();
    }
    let Some(scheme_end) = raw.find("://") else {
        return raw.to_string();
    };
    let start = scheme_end + 3;
    let end = raw[start..]
        .find(['/', '?', '#'])
        .map_or(raw.len(), |offset| start + offset);
    match raw[start..end].rfind('@') {
        Some(at) => format!("{}{}", &raw[..start], &raw[start + at + 1..]),
        None => raw.to_string(),
    }
}

/// Process-wide access mode cache backed by repository configuration.
pub struct AccessCache {
    git: ConfigMap,
    writer: Arc<dyn ConfigWriter>,
    modes: Mutex<HashMap<String, AccessMode>>,
}

impl fmt::Debug for AccessCache {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AccessCache")
            .field("urls", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl AccessCache {
    /// Cache seeded lazily from `git`, persisting changes through `writer`.
    #[must_use]
    pub fn new(git: &ConfigMap, writer: Arc<dyn ConfigWriter>) -> Self {
        Self {
            git: git.clone(),
            writer,
            modes: Mutex::new(HashMap::new()),
        }
    }

    /// Access mode for `raw_url`.
    #[must_use]
    pub fn access_for(&self, raw_url: &str) -> Access {
        let url = url_without_auth(raw_url);
        let mut modes = self.lock();
        let mode = *modes
            .entry(url.clone())
            .or_insert_with(|| self.configured(&url));
        drop(modes);
        Access::new(mode, url)
    }

    /// Record `access` in memory and persist it as `lfs.<url>.access`.
    ///
    /// [`AccessMode::None`] clears the persisted key.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration writer fails; the in-memory
    /// value is updated regardless.
    pub async fn set_access(&self, access: &Access) -> EndpointResult<()> {
        let key = format!("lfs.{}.access", access.url());
        debug!(url = %access.url(), mode = %access.mode(), "setting repository access");
        self.lock().insert(access.url().to_string(), access.mode());

        let result = match access.mode() {
            AccessMode::None => self.writer.unset_local(&key).await,
            mode => self.writer.set_local(&key, mode.as_str()).await,
        };
        result.map_err(|source| EndpointError::PersistAccess { key, source })
    }

    fn configured(&self, url: &str) -> AccessMode {
        UrlConfig::new(&self.git)
            .get("lfs", url, "access")
            .map_or(AccessMode::None, AccessMode::parse)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AccessMode>> {
        self.modes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
