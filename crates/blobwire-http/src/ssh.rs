//! SSH credential bridge.
//!
//! # Design
//! - [`SshResolver`] is the seam; [`SshAuthClient`] spawns the local SSH
//!   binary and [`SshCache`] wraps any resolver with an expiry-aware cache.
//! - Cache keys are `(user@host, port, path, operation)`. Entries within
//!   [`EXPIRY_LOOKAHEAD`] of expiring count as misses.
//! - A token with both `expires_at` and `expires_in` expires at the earlier
//!   of the two; a token with neither never expires.
//! - Standard input is inherited so SSH can prompt for passphrases.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use blobwire_config::{ConfigMap, TransportSettings};
use blobwire_endpoint::Endpoint;
use blobwire_telemetry::TransferMetrics;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer};
use tokio::process::Command;
use tracing::debug;

use crate::error::{SshError, SshResult};

/// Window before expiry in which a cached token is no longer served.
pub const EXPIRY_LOOKAHEAD: Duration = Duration::from_secs(5);

const DEFAULT_SSH: &str = "ssh";
const AUTHENTICATE_COMMAND: &str = "git-lfs-authenticate";

/// Short-lived HTTP credentials returned by the remote authenticate command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SshAuthResponse {
    /// API base URL to use instead of the endpoint URL; empty for none.
    #[serde(default)]
    pub href: String,
    /// Headers to attach to every request.
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    /// Absolute expiry.
    #[serde(default, deserialize_with = "deserialize_expires_at")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifetime in seconds from `created_at`; zero for none.
    #[serde(default)]
    pub expires_in: i64,
    /// When the token was obtained.
    #[serde(skip, default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn deserialize_expires_at<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(value.filter(|at| at.year() > 1))
}

impl Default for SshAuthResponse {
    fn default() -> Self {
        Self {
            href: String::new(),
            header: BTreeMap::new(),
            expires_at: None,
            expires_in: 0,
            created_at: Utc::now(),
        }
    }
}

impl SshAuthResponse {
    /// Instant the token stops being valid, or `None` if it never expires.
    #[must_use]
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        let relative = (self.expires_in != 0).then(|| {
            chrono::Duration::try_seconds(self.expires_in)
                .and_then(|lifetime| self.created_at.checked_add_signed(lifetime))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        match (self.expires_at, relative) {
            (Some(at), Some(relative)) => Some(at.min(relative)),
            (at, relative) => at.or(relative),
        }
    }

    /// Whether the token expires within `window` from now.
    #[must_use]
    pub fn is_expired_within(&self, window: Duration) -> bool {
        let Some(expires) = self.expires() else {
            return false;
        };
        chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_add_signed(window))
            .is_none_or(|horizon| expires < horizon)
    }
}

/// Resolves HTTP credentials for SSH-routed endpoints.
#[async_trait]
pub trait SshResolver: Send + Sync {
    /// Credentials for `endpoint` and a request using `method`.
    ///
    /// Endpoints without SSH metadata resolve to an empty response.
    async fn resolve(&self, endpoint: &Endpoint, method: &str) -> SshResult<SshAuthResponse>;
}

/// Runs `git-lfs-authenticate` over the local SSH client.
#[derive(Debug, Clone)]
pub struct SshAuthClient {
    git: ConfigMap,
    os: ConfigMap,
    default_ttl: Duration,
}

impl SshAuthClient {
    /// Client using `git` and `os` to pick the SSH program.
    #[must_use]
    pub fn new(git: &ConfigMap, os: &ConfigMap) -> Self {
        let settings = TransportSettings::from_config(git, os);
        Self {
            git: git.clone(),
            os: os.clone(),
            default_ttl: settings.default_token_ttl,
        }
    }
}

#[async_trait]
impl SshResolver for SshAuthClient {
    async fn resolve(&self, endpoint: &Endpoint, method: &str) -> SshResult<SshAuthResponse> {
        if !endpoint.ssh.is_present() {
            return Ok(SshAuthResponse::default());
        }

        let (program, args) = ssh_command(&self.os, &self.git, endpoint, method);
        debug!(program = %program, args = ?args, "run_command");
        let created_at = Utc::now();
        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| SshError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SshError::Command {
                program,
                code: output.status.code(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mut response: SshAuthResponse = serde_json::from_slice(&output.stdout)
            .map_err(|source| SshError::Decode { source })?;
        if response.expires_in == 0 && response.expires_at.is_none() {
            response.expires_in = i64::try_from(self.default_ttl.as_secs()).unwrap_or(i64::MAX);
        }
        response.created_at = created_at;
        Ok(response)
    }
}

/// Caches another resolver's tokens until shortly before they expire.
pub struct SshCache {
    inner: Arc<dyn SshResolver>,
    entries: Mutex<HashMap<CacheKey, SshAuthResponse>>,
    metrics: Option<TransferMetrics>,
}

type CacheKey = (String, Option<u16>, String, &'static str);

impl std::fmt::Debug for SshCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SshCache")
            .field("entries", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl SshCache {
    /// Cache in front of `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn SshResolver>, metrics: Option<TransferMetrics>) -> Self {
        Self {
            inner,
            entries: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Seed the cache, replacing any entry with the same key.
    pub fn insert(&self, endpoint: &Endpoint, method: &str, response: SshAuthResponse) {
        self.lock().insert(cache_key(endpoint, method), response);
    }

    /// Number of cached tokens, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, SshAuthResponse>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SshResolver for SshCache {
    async fn resolve(&self, endpoint: &Endpoint, method: &str) -> SshResult<SshAuthResponse> {
        if !endpoint.ssh.is_present() {
            return Ok(SshAuthResponse::default());
        }

        let key = cache_key(endpoint, method);
        let cached = self.lock().get(&key).cloned();
        if let Some(response) = cached {
            if response.is_expired_within(EXPIRY_LOOKAHEAD) {
                debug!(
                    user_and_host = %endpoint.ssh.user_and_host,
                    path = %endpoint.ssh.path,
                    operation = key.3,
                    "ssh cache expired"
                );
            } else {
                debug!(
                    user_and_host = %endpoint.ssh.user_and_host,
                    path = %endpoint.ssh.path,
                    operation = key.3,
                    "ssh cache"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_ssh_resolution("cache_hit");
                }
                return Ok(response);
            }
        }

        let response = self.inner.resolve(endpoint, method).await?;
        self.lock().insert(key, response.clone());
        Ok(response)
    }
}

fn cache_key(endpoint: &Endpoint, method: &str) -> CacheKey {
    (
        endpoint.ssh.user_and_host.clone(),
        endpoint.ssh.port,
        endpoint.ssh.path.clone(),
        endpoint.operation_for(method).as_str(),
    )
}

/// Program and arguments that run the authenticate command for `endpoint`.
///
/// `GIT_SSH_COMMAND` beats `GIT_SSH`, which beats `core.sshcommand`. Command
/// strings run through `sh -c` with the remaining arguments quoted.
#[must_use]
pub fn ssh_command(
    os: &ConfigMap,
    git: &ConfigMap,
    endpoint: &Endpoint,
    method: &str,
) -> (String, Vec<String>) {
    let (program, mut args, shell) = ssh_base_command(os, git, endpoint);
    args.push(format!(
        "{AUTHENTICATE_COMMAND} {} {}",
        endpoint.ssh.path,
        endpoint.operation_for(method)
    ));
    if shell {
        let quoted: Vec<String> = args.iter().map(|arg| shell_quote(arg)).collect();
        return (
            "sh".to_string(),
            vec!["-c".to_string(), format!("{program} {}", quoted.join(" "))],
        );
    }
    (program, args)
}

fn ssh_base_command(os: &ConfigMap, git: &ConfigMap, endpoint: &Endpoint) -> (String, Vec<String>, bool) {
    let non_empty = |value: Option<&str>| value.filter(|value| !value.trim().is_empty()).map(str::to_string);

    let (ssh, command, shell) = if let Some(command) = non_empty(os.get("GIT_SSH_COMMAND")) {
        (first_field(&command), command, true)
    } else if let Some(ssh) = non_empty(os.get("GIT_SSH")) {
        (ssh.clone(), ssh, false)
    } else if let Some(command) = non_empty(git.get("core.sshcommand")) {
        (first_field(&command), command, true)
    } else {
        (DEFAULT_SSH.to_string(), DEFAULT_SSH.to_string(), false)
    };

    let variant = SshVariant::detect(&ssh);
    let mut args = Vec::new();
    if variant == SshVariant::TortoisePlink {
        args.push("-batch".to_string());
    }
    if let Some(port) = endpoint.ssh.port {
        let flag = if variant == SshVariant::OpenSsh { "-p" } else { "-P" };
        args.push(flag.to_string());
        args.push(port.to_string());
    }
    if program_base(&ssh) == DEFAULT_SSH {
        args.push("--".to_string());
        args.push(endpoint.ssh.user_and_host.clone());
    } else {
        args.push(endpoint.ssh.user_and_host.trim_start_matches('-').to_string());
    }
    (command, args, shell)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SshVariant {
    OpenSsh,
    Plink,
    TortoisePlink,
}

impl SshVariant {
    fn detect(program: &str) -> Self {
        let base = program_base(program);
        if base.eq_ignore_ascii_case("plink") {
            Self::Plink
        } else if base.eq_ignore_ascii_case("tortoiseplink") {
            Self::TortoisePlink
        } else {
            Self::OpenSsh
        }
    }
}

/// File name of `program` without directories or extension.
fn program_base(program: &str) -> &str {
    let name = program.rsplit(['/', '\\']).next().unwrap_or(program);
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    }
}

fn first_field(command: &str) -> String {
    quoted_fields(command).into_iter().next().unwrap_or_default()
}

/// Split `input` on whitespace, honoring single quotes, double quotes and
/// backslash escapes.
#[must_use]
pub fn quoted_fields(input: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_field = false;
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_field = true;
                current.extend(chars.by_ref().take_while(|&next| next != '\''));
            }
            '"' => {
                in_field = true;
                while let Some(next) = chars.next() {
                    match next {
                        '"' => break,
                        '\\' => current.extend(chars.next()),
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_field = true;
                current.extend(chars.next());
            }
            ch if ch.is_whitespace() => {
                if in_field {
                    fields.push(std::mem::take(&mut current));
                    in_field = false;
                }
            }
            other => {
                in_field = true;
                current.push(other);
            }
        }
    }
    if in_field {
        fields.push(current);
    }
    fields
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "@%_+=:,./-".contains(ch));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
