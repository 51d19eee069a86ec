//! Helper backed by an askpass program (`GIT_ASKPASS`, `core.askpass`, `SSH_ASKPASS`).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::creds::{Creds, HOST, PASSWORD, PATH, PROTOCOL, USERNAME};
use crate::error::{CredsError, CredsResult};
use crate::helper::{CredentialHelper, Disposition};

/// Prompts for a user name and password through an external program.
///
/// The program receives a single prompt argument and prints the answer on
/// standard output. Values already present in the input are not re-prompted.
#[derive(Debug, Clone)]
pub struct AskPassCredentialHelper {
    program: String,
}

impl AskPassCredentialHelper {
    /// Helper invoking `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Program invoked for each prompt.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    async fn value(&self, input: &Creds, field: &str, label: &str, user: &str) -> CredsResult<String> {
        let given = input.first(field);
        if !given.is_empty() {
            return Ok(given.to_string());
        }
        let prompt = format!("{label} for \"{}\"", prompt_url(input, user));
        self.run(&prompt).await
    }

    async fn run(&self, prompt: &str) -> CredsResult<String> {
        debug!(program = %self.program, prompt, "filling with askpass");
        let output = Command::new(&self.program)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| CredsError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() || !stderr.is_empty() {
            return Err(CredsError::AskPass {
                program: self.program.clone(),
                message: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn prompt_url(input: &Creds, user: &str) -> String {
    let mut url = format!("{}://", input.first(PROTOCOL));
    if !user.is_empty() {
        url.push_str(user);
        url.push('@');
    }
    url.push_str(input.first(HOST));
    let path = input.first(PATH);
    if !path.is_empty() {
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
    }
    url
}

#[async_trait]
impl CredentialHelper for AskPassCredentialHelper {
    async fn fill(&self, input: &Creds) -> CredsResult<Option<Creds>> {
        let username = self.value(input, USERNAME, "Username", "").await?;
        let password = self.value(input, PASSWORD, "Password", &username).await?;

        let mut filled = input.clone();
        filled.set(USERNAME, username);
        filled.set(PASSWORD, password);
        Ok(Some(filled))
    }

    async fn approve(&self, _creds: &Creds) -> CredsResult<Disposition> {
        Ok(Disposition::Handled)
    }

    async fn reject(&self, _creds: &Creds) -> CredsResult<Disposition> {
        Ok(Disposition::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_url_includes_user_and_path() {
        let input = Creds::from_pairs([
            (PROTOCOL, "https"),
            (HOST, "git.example.com:8443"),
            (PATH, "org/repo"),
        ]);
        assert_eq!(prompt_url(&input, ""), "https://git.example.com:8443/org/repo");
        assert_eq!(
            prompt_url(&input, "alice"),
            "https://alice@git.example.com:8443/org/repo"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fill_prompts_for_missing_values_only() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let script = dir.path().join("askpass");
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$1\" in\n  Username*) echo bob ;;\n  Password*) echo \"  s3cret \" ;;\nesac\n",
        )?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
        let helper = AskPassCredentialHelper::new(script.display().to_string());

        let input = Creds::from_pairs([(PROTOCOL, "https"), (HOST, "example.com")]);
        let filled = helper
            .fill(&input)
            .await?
            .ok_or_else(|| anyhow::anyhow!("askpass produced nothing"))?;
        assert_eq!(filled.first(USERNAME), "bob");
        assert_eq!(filled.first(PASSWORD), "s3cret");
        assert_eq!(filled.first(HOST), "example.com");

        let input = Creds::from_pairs([(PROTOCOL, "https"), (HOST, "example.com"), (USERNAME, "carol")]);
        let filled = helper
            .fill(&input)
            .await?
            .ok_or_else(|| anyhow::anyhow!("askpass produced nothing"))?;
        assert_eq!(filled.first(USERNAME), "carol");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_output_is_an_error() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let script = dir.path().join("askpass");
        std::fs::write(&script, "#!/bin/sh\necho denied >&2\n")?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
        let helper = AskPassCredentialHelper::new(script.display().to_string());

        let input = Creds::from_pairs([(PROTOCOL, "https"), (HOST, "example.com")]);
        match helper.fill(&input).await {
            Err(CredsError::AskPass { message, .. }) => assert_eq!(message, "denied"),
            other => panic!("unexpected askpass result: {other:?}"),
        }
        Ok(())
    }
}
