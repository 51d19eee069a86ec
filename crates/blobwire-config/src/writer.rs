//! Persistence of repository-local configuration overrides.
//!
//! # Design
//! - Writers only ever touch the repository-local scope.
//! - Unsetting a missing key is not an error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Exit status `git config --unset` reports when the key does not exist.
const GIT_CONFIG_KEY_MISSING: i32 = 5;

/// Sink for persisted per-URL overrides such as `lfs.<url>.access`.
#[async_trait]
pub trait ConfigWriter: Send + Sync {
    /// Persist `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error when the value cannot be persisted.
    async fn set_local(&self, key: &str, value: &str) -> ConfigResult<()>;

    /// Remove `key`.
    ///
    /// # Errors
    ///
    /// Returns an error when the key cannot be removed.
    async fn unset_local(&self, key: &str) -> ConfigResult<()>;
}

/// Writer that shells out to `git config --local`.
#[derive(Debug, Clone, Default)]
pub struct GitConfigWriter {
    work_dir: Option<PathBuf>,
}

impl GitConfigWriter {
    /// Writer operating on the repository containing `work_dir`, or the
    /// process working directory when `None`.
    #[must_use]
    pub const fn new(work_dir: Option<PathBuf>) -> Self {
        Self { work_dir }
    }

    async fn run(&self, operation: &'static str, args: &[&str]) -> ConfigResult<()> {
        let mut command = Command::new("git");
        command
            .arg("config")
            .arg("--local")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|source| ConfigError::GitSpawn { operation, source })?;
        let code = output.status.code();
        if output.status.success()
            || (operation == "config.unset" && code == Some(GIT_CONFIG_KEY_MISSING))
        {
            return Ok(());
        }
        Err(ConfigError::GitStatus {
            operation,
            code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ConfigWriter for GitConfigWriter {
    async fn set_local(&self, key: &str, value: &str) -> ConfigResult<()> {
        debug!(key, value, "persisting local git config");
        self.run("config.set", &[key, value]).await
    }

    async fn unset_local(&self, key: &str) -> ConfigResult<()> {
        debug!(key, "removing local git config");
        self.run("config.unset", &["--unset", key]).await
    }
}

/// In-memory writer that records every persisted key.
#[derive(Debug, Default)]
pub struct MemoryConfigWriter {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigWriter {
    /// Empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value currently recorded for `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(key).cloned())
    }
}

#[async_trait]
impl ConfigWriter for MemoryConfigWriter {
    async fn set_local(&self, key: &str, value: &str) -> ConfigResult<()> {
        self.values
            .lock()
            .map_err(|_| ConfigError::WriterPoisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn unset_local(&self, key: &str) -> ConfigResult<()> {
        self.values
            .lock()
            .map_err(|_| ConfigError::WriterPoisoned)?
            .remove(key);
        Ok(())
    }
}
