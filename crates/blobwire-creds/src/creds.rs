//! Credential map exchanged with helpers.
//!
//! # Design
//! - Keys follow `git credential`'s vocabulary (`protocol`, `host`, `path`,
//!   `username`, `password`); every key may carry several values.
//! - The line protocol forbids newlines and NUL bytes in values.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

use crate::error::{CredsError, CredsResult};

/// Field holding the protocol (`https`, `http`).
pub const PROTOCOL: &str = "protocol";
/// Field holding `host[:port]`.
pub const HOST: &str = "host";
/// Field holding the repository path without a leading slash.
pub const PATH: &str = "path";
/// Field holding the user name.
pub const USERNAME: &str = "username";
/// Field holding the secret.
pub const PASSWORD: &str = "password";
/// Field recording which helper produced the credential.
pub const SOURCE: &str = "source";

/// String-keyed, multi-valued credential map.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Creds {
    fields: BTreeMap<String, Vec<String>>,
}

impl Debug for Creds {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        let mut map = formatter.debug_map();
        for (key, values) in &self.fields {
            if key == PASSWORD {
                map.entry(key, &"<redacted>");
            } else {
                map.entry(key, values);
            }
        }
        map.finish()
    }
}

impl Creds {
    /// Empty credential map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from single-valued pairs.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut creds = Self::new();
        for (key, value) in pairs {
            creds.push(key, value);
        }
        creds
    }

    /// First value recorded for `key`, or `""` when absent.
    #[must_use]
    pub fn first(&self, key: &str) -> &str {
        self.fields
            .get(key)
            .and_then(|values| values.first())
            .map_or("", String::as_str)
    }

    /// Every value recorded for `key`.
    #[must_use]
    pub fn all(&self, key: &str) -> &[String] {
        self.fields.get(key).map_or(&[], Vec::as_slice)
    }

    /// Replace `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), vec![value.into()]);
    }

    /// Replace `key` with every value in `values`; an empty slice removes it.
    pub fn set_all(&mut self, key: impl Into<String>, values: &[String]) {
        let key = key.into();
        if values.is_empty() {
            self.fields.remove(&key);
        } else {
            self.fields.insert(key, values.to_vec());
        }
    }

    /// Append a value for `key`.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.entry(key.into()).or_default().push(value.into());
    }

    /// Whether the map holds no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether both a user name and a password are present and non-empty.
    #[must_use]
    pub fn has_user_and_password(&self) -> bool {
        !self.first(USERNAME).is_empty() && !self.first(PASSWORD).is_empty()
    }

    /// Copy every field of `other` over this map.
    #[must_use]
    pub fn merged_with(mut self, other: &Self) -> Self {
        for (key, values) in &other.fields {
            self.fields.insert(key.clone(), values.clone());
        }
        self
    }

    /// Encode the map as `key=value` lines for a helper's standard input.
    ///
    /// # Errors
    ///
    /// Returns an error when a value contains a newline or NUL byte, or a
    /// carriage return while `protect_protocol` is set.
    pub fn to_helper_input(&self, protect_protocol: bool) -> CredsResult<String> {
        let mut buffer = String::new();
        for (key, values) in &self.fields {
            for value in values {
                if value.contains('\n') {
                    return Err(invalid(key, "value contains newline"));
                }
                if protect_protocol && value.contains('\r') {
                    return Err(invalid(key, "value contains carriage return"));
                }
                if value.contains('\0') {
                    return Err(invalid(key, "value contains null byte"));
                }
                buffer.push_str(key);
                buffer.push('=');
                buffer.push_str(value);
                buffer.push('\n');
            }
        }
        Ok(buffer)
    }

    /// Decode `key=value` lines printed by a helper; empty values are skipped.
    #[must_use]
    pub fn parse_helper_output(output: &str) -> Self {
        let mut creds = Self::new();
        for line in output.lines() {
            if let Some((key, value)) = line.split_once('=')
                && !value.is_empty()
            {
                creds.push(key, value);
            }
        }
        creds
    }
}

fn invalid(key: &str, reason: &'static str) -> CredsError {
    CredsError::InvalidValue {
        key: key.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_input_rejects_line_breaks_and_nul() {
        let creds = Creds::from_pairs([(USERNAME, "a\nb")]);
        assert!(matches!(
            creds.to_helper_input(true),
            Err(CredsError::InvalidValue { reason: "value contains newline", .. })
        ));

        let creds = Creds::from_pairs([(PASSWORD, "a\rb")]);
        assert!(creds.to_helper_input(true).is_err());
        assert_eq!(
            creds.to_helper_input(false).ok().as_deref(),
            Some("password=a\rb\n")
        );

        let creds = Creds::from_pairs([(HOST, "a\0b")]);
        assert!(creds.to_helper_input(false).is_err());
    }

    #[test]
    fn helper_output_skips_empty_values_and_accumulates() {
        let creds =
            Creds::parse_helper_output("protocol=https\nhost=example.com\nusername=\nwwwauth[]=a\nwwwauth[]=b\nnoise\n");
        assert_eq!(creds.first(PROTOCOL), "https");
        assert_eq!(creds.first(USERNAME), "");
        assert_eq!(creds.all("wwwauth[]").len(), 2);
        assert!(!creds.has_user_and_password());
    }

    #[test]
    fn debug_output_redacts_password() {
        let creds = Creds::from_pairs([(USERNAME, "user"), (PASSWORD, "hunter2")]);
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn merged_with_overrides_fields() {
        let base = Creds::from_pairs([(PROTOCOL, "https"), (HOST, "example.com")]);
        let filled = Creds::from_pairs([(USERNAME, "u"), (PASSWORD, "p")]);
        let merged = base.merged_with(&filled);
        assert_eq!(merged.first(HOST), "example.com");
        assert!(merged.has_user_and_password());
    }
}
