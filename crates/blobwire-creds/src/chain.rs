//! Ordered fallback across several credential helpers.
//!
//! # Design
//! - The first helper that fills wins; helpers that pass are skipped silently.
//! - A helper that errors during fill is never consulted again by this chain.
//! - A failed approval rejects the credential from every earlier helper so no
//!   cache keeps a credential the authoritative helper never stored.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::creds::Creds;
use crate::error::{CredsError, CredsResult};
use crate::helper::{CredentialHelper, Disposition};

/// Chain of helpers consulted in order.
pub struct CredentialHelpers {
    helpers: Vec<Arc<dyn CredentialHelper>>,
    skipped: Mutex<HashSet<usize>>,
}

impl std::fmt::Debug for CredentialHelpers {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CredentialHelpers")
            .field("helpers", &self.helpers.len())
            .finish_non_exhaustive()
    }
}

impl CredentialHelpers {
    /// Chain over `helpers`, consulted in the given order.
    #[must_use]
    pub fn new(helpers: Vec<Arc<dyn CredentialHelper>>) -> Self {
        Self {
            helpers,
            skipped: Mutex::new(HashSet::new()),
        }
    }

    fn is_skipped(&self, index: usize) -> bool {
        self.lock().contains(&index)
    }

    fn skip(&self, index: usize) {
        self.lock().insert(index);
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<usize>> {
        self.skipped.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialHelper for CredentialHelpers {
    async fn fill(&self, input: &Creds) -> CredsResult<Option<Creds>> {
        let mut messages = Vec::new();
        for (index, helper) in self.helpers.iter().enumerate() {
            if self.is_skipped(index) {
                continue;
            }
            match helper.fill(input).await {
                Ok(Some(creds)) => return Ok(Some(creds)),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, helper = index, "credential fill error");
                    self.skip(index);
                    messages.push(describe(&err));
                }
            }
        }

        if messages.is_empty() {
            Ok(None)
        } else {
            Err(CredsError::FillErrors { messages })
        }
    }

    async fn approve(&self, creds: &Creds) -> CredsResult<Disposition> {
        for (index, helper) in self.helpers.iter().enumerate() {
            if self.is_skipped(index) {
                continue;
            }
            match helper.approve(creds).await {
                Ok(Disposition::Passed) => {}
                Ok(Disposition::Handled) => return Ok(Disposition::Handled),
                Err(err) => {
                    for (earlier, previous) in self.helpers.iter().enumerate().take(index) {
                        if self.is_skipped(earlier) {
                            continue;
                        }
                        if let Err(reject_err) = previous.reject(creds).await {
                            debug!(error = %reject_err, helper = earlier, "reject after failed approval");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Err(CredsError::NoHelpers {
            operation: "approve",
        })
    }

    async fn reject(&self, creds: &Creds) -> CredsResult<Disposition> {
        for (index, helper) in self.helpers.iter().enumerate() {
            if self.is_skipped(index) {
                continue;
            }
            match helper.reject(creds).await? {
                Disposition::Passed => {}
                Disposition::Handled => return Ok(Disposition::Handled),
            }
        }
        Err(CredsError::NoHelpers {
            operation: "reject",
        })
    }
}

fn describe(err: &CredsError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CredentialCacher;
    use crate::creds::{HOST, PASSWORD, PROTOCOL, USERNAME};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Scripted {
        fill: Option<Creds>,
        fail_fill: bool,
        fail_approve: bool,
        fills: AtomicUsize,
        rejects: AtomicUsize,
    }

    #[async_trait]
    impl CredentialHelper for Scripted {
        async fn fill(&self, _input: &Creds) -> CredsResult<Option<Creds>> {
            self.fills.fetch_add(1, Ordering::SeqCst);
            if self.fail_fill {
                return Err(CredsError::NotConfigured);
            }
            Ok(self.fill.clone())
        }

        async fn approve(&self, _creds: &Creds) -> CredsResult<Disposition> {
            if self.fail_approve {
                return Err(CredsError::HelperExit {
                    subcommand: "approve",
                    code: Some(1),
                });
            }
            Ok(Disposition::Handled)
        }

        async fn reject(&self, _creds: &Creds) -> CredsResult<Disposition> {
            self.rejects.fetch_add(1, Ordering::SeqCst);
            Ok(Disposition::Handled)
        }
    }

    fn creds() -> Creds {
        Creds::from_pairs([
            (PROTOCOL, "https"),
            (HOST, "example.com"),
            (USERNAME, "u"),
            (PASSWORD, "p"),
        ])
    }

    #[test]
    fn skips_survive_a_poisoned_lock() {
        let chain = CredentialHelpers::new(Vec::new());
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = chain.lock();
            panic!("poison the skip list");
        }));
        assert!(poisoned.is_err());
        assert!(chain.skipped.is_poisoned());

        chain.skip(2);
        assert!(chain.is_skipped(2));
        assert!(!chain.is_skipped(0));
    }

    #[tokio::test]
    async fn erroring_helper_is_skipped_afterwards() -> anyhow::Result<()> {
        let broken = Arc::new(Scripted {
            fail_fill: true,
            ..Scripted::default()
        });
        let working = Arc::new(Scripted {
            fill: Some(creds()),
            ..Scripted::default()
        });
        let chain = CredentialHelpers::new(vec![broken.clone(), working.clone()]);

        assert_eq!(chain.fill(&creds()).await?, Some(creds()));
        assert_eq!(chain.fill(&creds()).await?, Some(creds()));
        assert_eq!(broken.fills.load(Ordering::SeqCst), 1);
        assert_eq!(working.fills.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn all_failures_are_reported_together() {
        let chain = CredentialHelpers::new(vec![
            Arc::new(Scripted {
                fail_fill: true,
                ..Scripted::default()
            }),
            Arc::new(Scripted::default()),
        ]);
        match chain.fill(&creds()).await {
            Err(CredsError::FillErrors { messages }) => {
                assert_eq!(messages, vec!["no credential helper configured".to_string()]);
            }
            other => panic!("unexpected fill result: {other:?}"),
        }
        assert!(matches!(chain.fill(&creds()).await, Ok(None)));
    }

    #[tokio::test]
    async fn failed_approval_rejects_from_earlier_helpers() -> anyhow::Result<()> {
        let cache = Arc::new(CredentialCacher::new());
        let failing = Arc::new(Scripted {
            fail_approve: true,
            ..Scripted::default()
        });
        let chain = CredentialHelpers::new(vec![cache.clone(), failing]);

        assert!(chain.approve(&creds()).await.is_err());
        assert!(cache.fill(&creds()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn approve_and_reject_need_a_handling_helper() -> anyhow::Result<()> {
        let chain = CredentialHelpers::new(vec![Arc::new(CredentialCacher::new())]);
        assert!(matches!(
            chain.approve(&creds()).await,
            Err(CredsError::NoHelpers { operation: "approve" })
        ));
        assert!(matches!(
            chain.reject(&creds()).await,
            Err(CredsError::NoHelpers { operation: "reject" })
        ));

        let terminal = Arc::new(Scripted::default());
        let chain = CredentialHelpers::new(vec![Arc::new(CredentialCacher::new()), terminal.clone()]);
        assert_eq!(chain.reject(&creds()).await?, Disposition::Handled);
        assert_eq!(terminal.rejects.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
