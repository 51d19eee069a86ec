//! Helper backed by `git credential`.
//!
//! # Design
//! - Standard error is inherited: git's cache daemon keeps it open, so
//!   capturing it would block until the daemon exits.
//! - `fill` exiting with status 128 means no helper produced credentials.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::creds::{Creds, HOST, PATH, PROTOCOL};
use crate::error::{CredsError, CredsResult};
use crate::helper::{CredentialHelper, Disposition};

/// Exit status `git credential fill` uses when nothing was filled.
const EXIT_NOT_FILLED: i32 = 128;

/// Runs `git credential fill|approve|reject`.
#[derive(Debug, Clone)]
pub struct CommandCredentialHelper {
    program: String,
    skip_prompt: bool,
    protect_protocol: bool,
}

impl Default for CommandCredentialHelper {
    fn default() -> Self {
        Self::new("git", false, true)
    }
}

impl CommandCredentialHelper {
    /// Helper running `program credential <subcommand>`.
    ///
    /// With `skip_prompt`, any helper failure is reported as a disabled
    /// terminal prompt instead of falling through.
    #[must_use]
    pub fn new(program: impl Into<String>, skip_prompt: bool, protect_protocol: bool) -> Self {
        Self {
            program: program.into(),
            skip_prompt,
            protect_protocol,
        }
    }

    async fn exec(&self, subcommand: &'static str, input: &Creds) -> CredsResult<Option<Creds>> {
        let stdin_payload = input.to_helper_input(self.protect_protocol)?;
        debug!(
            subcommand,
            protocol = input.first(PROTOCOL),
            host = input.first(HOST),
            path = input.first(PATH),
            "git credential"
        );

        let mut child = Command::new(&self.program)
            .args(["credential", subcommand])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| self.spawn_error(source))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_payload.as_bytes())
                .await
                .map_err(|source| self.spawn_error(source))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|source| self.spawn_error(source))?;

        if !output.status.success() {
            if self.skip_prompt {
                return Err(CredsError::PromptDisabled {
                    protocol: input.first(PROTOCOL).to_string(),
                    host: input.first(HOST).to_string(),
                });
            }
            let code = output.status.code();
            if subcommand == "fill" && code == Some(EXIT_NOT_FILLED) {
                return Ok(None);
            }
            return Err(CredsError::HelperExit { subcommand, code });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Some(Creds::parse_helper_output(&stdout)))
    }

    fn spawn_error(&self, source: std::io::Error) -> CredsError {
        CredsError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

#[async_trait]
impl CredentialHelper for CommandCredentialHelper {
    async fn fill(&self, input: &Creds) -> CredsResult<Option<Creds>> {
        self.exec("fill", input).await
    }

    async fn approve(&self, creds: &Creds) -> CredsResult<Disposition> {
        self.exec("approve", creds).await?;
        Ok(Disposition::Handled)
    }

    async fn reject(&self, creds: &Creds) -> CredsResult<Disposition> {
        self.exec("reject", creds).await?;
        Ok(Disposition::Handled)
    }
}
