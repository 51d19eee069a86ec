//! The credential helper capability.

use async_trait::async_trait;

use crate::creds::Creds;
use crate::error::{CredsError, CredsResult};

/// Whether a helper acted on an approve or reject call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The helper stored or discarded the credential.
    Handled,
    /// The helper has nothing to do; the next helper should be asked.
    Passed,
}

/// Source of credentials that can also learn from request outcomes.
///
/// Implementations are shared across concurrent requests and must provide
/// their own locking when they keep state.
#[async_trait]
pub trait CredentialHelper: Send + Sync {
    /// Supply credentials matching `input`; `Ok(None)` lets the next helper try.
    ///
    /// # Errors
    ///
    /// Returns an error when the helper failed outright.
    async fn fill(&self, input: &Creds) -> CredsResult<Option<Creds>>;

    /// Record that `creds` authenticated successfully.
    ///
    /// # Errors
    ///
    /// Returns an error when the helper failed to store the credential.
    async fn approve(&self, creds: &Creds) -> CredsResult<Disposition>;

    /// Record that `creds` were refused by the server.
    ///
    /// # Errors
    ///
    /// Returns an error when the helper failed to discard the credential.
    async fn reject(&self, creds: &Creds) -> CredsResult<Disposition>;
}

/// Helper used when credential lookup is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCredentialHelper;

#[async_trait]
impl CredentialHelper for NullCredentialHelper {
    async fn fill(&self, _input: &Creds) -> CredsResult<Option<Creds>> {
        Err(CredsError::NotConfigured)
    }

    async fn approve(&self, _creds: &Creds) -> CredsResult<Disposition> {
        Ok(Disposition::Handled)
    }

    async fn reject(&self, _creds: &Creds) -> CredsResult<Disposition> {
        Ok(Disposition::Handled)
    }
}
