//! In-memory credential cache.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::creds::{Creds, HOST, PATH, PROTOCOL};
use crate::error::CredsResult;
use crate::helper::{CredentialHelper, Disposition};

/// Remembers approved credentials for the life of the process.
///
/// Approve and reject always pass through so the next helper also sees them.
#[derive(Debug, Default)]
pub struct CredentialCacher {
    creds: Mutex<HashMap<String, Creds>>,
}

impl CredentialCacher {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(creds: &Creds) -> String {
        format!(
            "{}//{}//{}",
            creds.first(PROTOCOL),
            creds.first(HOST),
            creds.first(PATH)
        )
    }
}

#[async_trait]
impl CredentialHelper for CredentialCacher {
    async fn fill(&self, input: &Creds) -> CredsResult<Option<Creds>> {
        let key = Self::key(input);
        let cached = self
            .creds
            .lock()
            .ok()
            .and_then(|creds| creds.get(&key).cloned());
        if cached.is_some() {
            debug!(
                protocol = input.first(PROTOCOL),
                host = input.first(HOST),
                path = input.first(PATH),
                "credential cache hit"
            );
        }
        Ok(cached)
    }

    async fn approve(&self, creds: &Creds) -> CredsResult<Disposition> {
        let key = Self::key(creds);
        if let Ok(mut cache) = self.creds.lock() {
            if cache.contains_key(&key) {
                return Ok(Disposition::Handled);
            }
            cache.insert(key, creds.clone());
        }
        Ok(Disposition::Passed)
    }

    async fn reject(&self, creds: &Creds) -> CredsResult<Disposition> {
        let key = Self::key(creds);
        if let Ok(mut cache) = self.creds.lock() {
            cache.remove(&key);
        }
        Ok(Disposition::Passed)
    }
}
