//! Error types for credential helpers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while filling, approving, or rejecting credentials.
#[derive(Debug, Error)]
pub enum CredsError {
    /// A credential value cannot be sent over the line-based helper protocol.
    #[error("invalid credential value")]
    InvalidValue {
        /// Credential field holding the value.
        key: String,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Spawning a helper program failed.
    #[error("failed to run credential helper")]
    Spawn {
        /// Program that could not be started.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// `git credential <subcommand>` exited unsuccessfully.
    #[error("git credential exited unsuccessfully")]
    HelperExit {
        /// Subcommand that failed (`fill`, `approve`, `reject`).
        subcommand: &'static str,
        /// Exit code when the process was not killed by a signal.
        code: Option<i32>,
    },
    /// Prompting is disabled and no helper could supply credentials.
    #[error("terminal prompts disabled; change GIT_TERMINAL_PROMPT to be prompted for credentials")]
    PromptDisabled {
        /// Protocol of the requested credential.
        protocol: String,
        /// Host of the requested credential.
        host: String,
    },
    /// The askpass program reported an error on standard error.
    #[error("askpass program failed")]
    AskPass {
        /// Askpass program that was invoked.
        program: String,
        /// Trimmed standard error output.
        message: String,
    },
    /// Reading the netrc file failed.
    #[error("failed to read netrc file")]
    NetrcRead {
        /// Netrc file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The netrc file contained a dangling keyword.
    #[error("malformed netrc file")]
    NetrcSyntax {
        /// Keyword missing its value.
        token: String,
    },
    /// Every helper in a chain failed to fill.
    #[error("credential fill errors")]
    FillErrors {
        /// One message per failing helper, in chain order.
        messages: Vec<String>,
    },
    /// No helper in a chain accepted the operation.
    #[error("no valid credential helpers")]
    NoHelpers {
        /// Operation that found no helper (`approve`, `reject`).
        operation: &'static str,
    },
    /// No credential helper is configured at all.
    #[error("no credential helper configured")]
    NotConfigured,
}

/// Convenience alias for credential results.
pub type CredsResult<T> = Result<T, CredsError>;
