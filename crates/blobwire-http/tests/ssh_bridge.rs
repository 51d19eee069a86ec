#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use blobwire_config::ConfigMap;
use blobwire_endpoint::{Endpoint, SshMetadata};
use blobwire_http::{SshAuthClient, SshError, SshResolver};

fn endpoint() -> Endpoint {
    let mut endpoint = Endpoint::from_url("https://git.example.com/org/repo.git/info/lfs");
    endpoint.ssh = SshMetadata {
        user_and_host: "git@git.example.com".to_string(),
        port: None,
        path: "org/repo".to_string(),
    };
    endpoint
}

fn fake_ssh(dir: &Path, body: &str) -> anyhow::Result<String> {
    let path = dir.join("fake-ssh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path.to_string_lossy().into_owned())
}

fn resolver(ssh: &str, git: &[(&str, &str)]) -> SshAuthClient {
    SshAuthClient::new(
        &ConfigMap::git_from_pairs(git.iter().copied()),
        &ConfigMap::environment_from_pairs([("GIT_SSH", ssh)]),
    )
}

#[tokio::test]
async fn authenticate_output_is_parsed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let args = dir.path().join("args");
    let ssh = fake_ssh(
        dir.path(),
        &format!(
            "printf '%s\\n' \"$@\" > '{}'\necho '{{\"href\":\"https://x/\",\"header\":{{\"A\":\"b\"}},\"expires_in\":30}}'",
            args.display()
        ),
    )?;

    let response = resolver(&ssh, &[]).resolve(&endpoint(), "GET").await?;
    assert_eq!(response.href, "https://x/");
    assert_eq!(response.header.get("A").map(String::as_str), Some("b"));
    assert_eq!(response.expires_in, 30);

    let recorded = fs::read_to_string(&args)?;
    assert!(recorded.contains("git@git.example.com"));
    assert!(recorded.contains("git-lfs-authenticate org/repo download"));
    Ok(())
}

#[tokio::test]
async fn default_ttl_applies_without_expiry() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ssh = fake_ssh(dir.path(), "echo '{\"href\":\"https://x/\"}'")?;

    let response = resolver(&ssh, &[("lfs.defaulttokenttl", "120")])
        .resolve(&endpoint(), "POST")
        .await?;
    assert_eq!(response.expires_in, 120);
    assert!(response.expires().is_some());

    let response = resolver(&ssh, &[]).resolve(&endpoint(), "POST").await?;
    assert_eq!(response.expires_in, 0);
    assert!(response.expires().is_none());
    Ok(())
}

#[tokio::test]
async fn stderr_becomes_the_error_message() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ssh = fake_ssh(dir.path(), "echo 'denied' >&2\nexit 255")?;

    let err = resolver(&ssh, &[])
        .resolve(&endpoint(), "GET")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected ssh failure"))?;
    match &err {
        SshError::Command { code, message, .. } => {
            assert_eq!(*code, Some(255));
            assert_eq!(message, "denied");
        }
        other => anyhow::bail!("unexpected error: {other}"),
    }
    assert_eq!(err.to_string(), "ssh: denied");
    Ok(())
}

#[tokio::test]
async fn unparsable_output_is_a_decode_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ssh = fake_ssh(dir.path(), "echo 'Welcome to git.example.com'")?;

    let result = resolver(&ssh, &[]).resolve(&endpoint(), "GET").await;
    assert!(matches!(result, Err(SshError::Decode { .. })));
    Ok(())
}

#[tokio::test]
async fn endpoints_without_ssh_skip_the_subprocess() -> anyhow::Result<()> {
    let response = resolver("/nonexistent/ssh", &[])
        .resolve(&Endpoint::from_url("https://git.example.com/repo"), "GET")
        .await?;
    assert!(response.href.is_empty());
    Ok(())
}
