//! Multi-valued key maps backing git and OS environment snapshots.
//!
//! # Design
//! - Git keys are case-folded on insert and lookup; OS variables are not.
//! - Every key keeps all of its values in insertion order; single lookups see
//!   the last one, matching git's "last one wins" rule.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Snapshot of configuration key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMap {
    values: BTreeMap<String, Vec<String>>,
    fold_case: bool,
}

impl ConfigMap {
    /// Empty map with git's case-insensitive key semantics.
    #[must_use]
    pub const fn git() -> Self {
        Self {
            values: BTreeMap::new(),
            fold_case: true,
        }
    }

    /// Empty map with case-sensitive keys, as used for OS environment variables.
    #[must_use]
    pub const fn environment() -> Self {
        Self {
            values: BTreeMap::new(),
            fold_case: false,
        }
    }

    /// Build a git map from literal pairs; repeated keys accumulate values.
    #[must_use]
    pub fn git_from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut map = Self::git();
        for (key, value) in pairs {
            map.insert(key.as_ref(), value);
        }
        map
    }

    /// Build an environment map from literal pairs.
    #[must_use]
    pub fn environment_from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut map = Self::environment();
        for (key, value) in pairs {
            map.insert(key.as_ref(), value);
        }
        map
    }

    /// Snapshot the current process environment.
    #[must_use]
    pub fn from_process_env() -> Self {
        Self::environment_from_pairs(std::env::vars())
    }

    /// Parse the NUL-delimited output of `git config --list -z`.
    ///
    /// Each record is `key\nvalue`; a record without a newline is an implicit
    /// boolean and reads as `true`.
    #[must_use]
    pub fn parse_git_list(output: &str) -> Self {
        let mut map = Self::git();
        for record in output.split('\0').filter(|record| !record.is_empty()) {
            match record.split_once('\n') {
                Some((key, value)) => map.insert(key, value),
                None => map.insert(record, "true"),
            }
        }
        map
    }

    /// Load the effective git configuration by running `git config --list -z`.
    ///
    /// # Errors
    ///
    /// Returns an error when git cannot be spawned, exits unsuccessfully, or
    /// prints non UTF-8 output.
    pub async fn load_git(work_dir: Option<&Path>) -> ConfigResult<Self> {
        let mut command = Command::new("git");
        command
            .args(["config", "--list", "-z"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = work_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|source| ConfigError::GitSpawn {
                operation: "config.list",
                source,
            })?;
        if !output.status.success() {
            return Err(ConfigError::GitStatus {
                operation: "config.list",
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|source| ConfigError::GitOutputUtf8 { source })?;
        let map = Self::parse_git_list(&stdout);
        debug!(keys = map.values.len(), "loaded git configuration");
        Ok(map)
    }

    /// Append a value for `key`.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let key = self.normalize(key);
        self.values.entry(key).or_default().push(value.into());
    }

    /// Replace every value of `key` with a single value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = self.normalize(key);
        self.values.insert(key, vec![value.into()]);
    }

    /// Remove `key` entirely.
    pub fn remove(&mut self, key: &str) {
        let key = self.normalize(key);
        self.values.remove(&key);
    }

    /// Last value recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&self.normalize(key))
            .and_then(|values| values.last())
            .map(String::as_str)
    }

    /// Every value recorded for `key`, oldest first.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.values
            .get(&self.normalize(key))
            .map_or(&[], Vec::as_slice)
    }

    /// Whether `key` has at least one value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(&self.normalize(key))
    }

    /// Boolean value of `key` using git's truthiness rules.
    #[must_use]
    pub fn bool(&self, key: &str, default: bool) -> bool {
        parse_bool(self.get(key).unwrap_or_default(), default)
    }

    /// Integer value of `key`, or `default` when unset or malformed.
    #[must_use]
    pub fn int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .filter(|value| !value.is_empty())
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Iterate over every key and its values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn normalize(&self, key: &str) -> String {
        if self.fold_case {
            key.to_ascii_lowercase()
        } else {
            key.to_string()
        }
    }
}

/// Interpret `value` the way git interprets boolean configuration.
///
/// Empty input yields `default`; unrecognised input is `false`.
#[must_use]
pub fn parse_bool(value: &str, default: bool) -> bool {
    if value.is_empty() {
        return default;
    }
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "on" | "yes" | "t"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_keys_fold_case_and_keep_every_value() {
        let map = ConfigMap::git_from_pairs([
            ("URL.https://Example.com/.insteadOf", "ex:"),
            ("url.https://example.com/.insteadof", "example:"),
        ]);
        assert_eq!(map.get("url.https://example.com/.insteadof"), Some("example:"));
        assert_eq!(map.get_all("Url.https://EXAMPLE.com/.InsteadOf").len(), 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn environment_keys_are_case_sensitive() {
        let map = ConfigMap::environment_from_pairs([("HTTPS_PROXY", "a"), ("https_proxy", "b")]);
        assert_eq!(map.get("HTTPS_PROXY"), Some("a"));
        assert_eq!(map.get("https_proxy"), Some("b"));
        assert_eq!(map.get("Https_Proxy"), None);
    }

    #[test]
    fn parse_git_list_handles_implicit_booleans() {
        let map = ConfigMap::parse_git_list(
            "core.bare\nfalse\0lfs.locksverify\0remote.origin.url\nhttps://h/r\0",
        );
        assert!(!map.bool("core.bare", true));
        assert!(map.bool("lfs.locksverify", false));
        assert_eq!(map.get("remote.origin.url"), Some("https://h/r"));
    }

    #[test]
    fn bool_and_int_follow_git_rules() {
        let map = ConfigMap::git_from_pairs([
            ("a.yes", "YES"),
            ("a.off", "off"),
            ("a.junk", "maybe"),
            ("a.empty", ""),
            ("a.num", " 12 "),
            ("a.bad", "twelve"),
        ]);
        assert!(map.bool("a.yes", false));
        assert!(!map.bool("a.off", true));
        assert!(!map.bool("a.junk", true));
        assert!(map.bool("a.empty", true));
        assert!(map.bool("a.missing", true));
        assert_eq!(map.int("a.num", 0), 12);
        assert_eq!(map.int("a.bad", 7), 7);
        assert_eq!(map.int("a.missing", 3), 3);
    }

    #[test]
    fn set_and_remove_replace_values() {
        let mut map = ConfigMap::git();
        map.insert("lfs.url", "one");
        map.insert("lfs.url", "two");
        map.set("lfs.url", "three");
        assert_eq!(map.get_all("lfs.url"), ["three".to_string()]);
        map.remove("LFS.URL");
        assert!(!map.contains("lfs.url"));
        assert!(map.is_empty());
    }
}
