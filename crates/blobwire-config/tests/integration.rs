use std::process::Command;

use blobwire_config::{ConfigMap, ConfigWriter, GitConfigWriter, TransportSettings, UrlConfig};

fn init_repo() -> anyhow::Result<Option<tempfile::TempDir>> {
    let dir = tempfile::tempdir()?;
    let status = match Command::new("git")
        .args(["init", "--quiet"])
        .current_dir(dir.path())
        .status()
    {
        Ok(status) => status,
        Err(err) => {
            eprintln!("skipping git-backed config test: {err}");
            return Ok(None);
        }
    };
    if !status.success() {
        eprintln!("skipping git-backed config test: git init failed");
        return Ok(None);
    }
    Ok(Some(dir))
}

#[tokio::test]
async fn git_writer_round_trips_through_loaded_config() -> anyhow::Result<()> {
    let Some(repo) = init_repo()? else {
        return Ok(());
    };
    let writer = GitConfigWriter::new(Some(repo.path().to_path_buf()));
    let key = "lfs.https://git.example.com/org/repo.git/info/lfs.access";

    writer.set_local(key, "ntlm").await?;
    writer.set_local("lfs.concurrenttransfers", "4").await?;
    writer
        .set_local("http.https://git.example.com.sslverify", "false")
        .await?;

    let git = ConfigMap::load_git(Some(repo.path())).await?;
    assert_eq!(git.get(key), Some("ntlm"));
    let settings = TransportSettings::from_config(&git, &ConfigMap::environment());
    assert_eq!(settings.concurrent_transfers, 4);
    assert!(!UrlConfig::new(&git).bool(
        "http",
        "https://git.example.com/org/repo.git/info/lfs",
        "sslverify",
        true
    ));

    writer.unset_local(key).await?;
    writer.unset_local(key).await?;
    let git = ConfigMap::load_git(Some(repo.path())).await?;
    assert!(!git.contains(key));
    Ok(())
}
