//! Repository observer.
//!
//! Polls a git working copy for movement of the watched ref and submits
//! every new tip to the dispatcher as `DISPATCH <sha>`. Each poll also asks
//! the dispatcher for `STATUS` and logs the counts, which makes the shared
//! log a usable progress view of the whole system.

use crate::logging::ci_log;
use crate::net::send_line;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

/// Deadline for every exchange with the dispatcher.
const DISPATCHER_TIMEOUT: Duration = Duration::from_secs(3);

/// Polls the repository forever.
pub async fn run_observer(
    repo: &Path,
    rev: &str,
    poll: Duration,
    dispatcher: &str,
    results_dir: &Path,
) -> Result<()> {
    ci_log(
        results_dir,
        "observer",
        &format!("watching {} ({}) every {:?}", repo.display(), rev, poll),
    );

    let mut last_tip: Option<String> = None;
    let mut tick = tokio::time::interval(poll);
    loop {
        tick.tick().await;

        let tip = match poll_tip(repo, rev).await {
            Ok(tip) => tip,
            Err(err) => {
                ci_log(results_dir, "observer", &format!("git poll failed: {:#}", err));
                continue;
            }
        };

        if last_tip.as_deref() != Some(tip.as_str()) {
            match send_line(dispatcher, &format!("DISPATCH {}", tip), DISPATCHER_TIMEOUT).await {
                Ok(reply) => {
                    ci_log(
                        results_dir,
                        "observer",
                        &format!("submitted {} ({})", tip, reply),
                    );
                    last_tip = Some(tip);
                }
                // leave last_tip untouched so the submission is retried
                Err(err) => {
                    ci_log(results_dir, "observer", &format!("submit failed: {:#}", err));
                }
            }
        }

        match send_line(dispatcher, "STATUS", DISPATCHER_TIMEOUT).await {
            Ok(reply) => ci_log(results_dir, "observer", &reply),
            Err(err) => ci_log(results_dir, "observer", &format!("status failed: {:#}", err)),
        }
    }
}

/// Fetches the remotes and resolves the watched ref to a sha.
async fn poll_tip(repo: &Path, rev: &str) -> Result<String> {
    git(repo, &["fetch", "--all", "--prune"]).await?;
    git(repo, &["rev-parse", rev]).await
}

async fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .await
        .context("failed to spawn git")?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    /// Builds a throwaway git repo with one commit. Returns `None` when git
    /// is not available so the tests become no-ops instead of failures.
    fn fixture_repo() -> Option<tempfile::TempDir> {
        let dir = tempfile::TempDir::new().unwrap();
        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .arg("-C")
                .arg(dir.path())
                .args(args)
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false)
        };
        if !run(&["init"]) {
            return None;
        }
        if !run(&[
            "-c",
            "user.email=ci@example.com",
            "-c",
            "user.name=ci",
            "commit",
            "--allow-empty",
            "-m",
            "init",
        ]) {
            return None;
        }
        Some(dir)
    }

    #[tokio::test]
    async fn poll_tip_resolves_the_watched_ref() {
        let Some(repo) = fixture_repo() else { return };
        let tip = poll_tip(repo.path(), "HEAD").await.unwrap();
        assert_eq!(tip.len(), 40);
        assert!(tip.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn poll_tip_fails_outside_a_repository() {
        let Some(_probe) = fixture_repo() else { return };
        let dir = tempfile::TempDir::new().unwrap();
        assert!(poll_tip(dir.path(), "HEAD").await.is_err());
    }

    #[tokio::test]
    async fn new_tip_is_submitted_exactly_once() {
        let Some(repo) = fixture_repo() else { return };

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let dispatcher = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let (reader, mut writer) = stream.into_split();
                let mut line = String::new();
                if BufReader::new(reader).read_line(&mut line).await.is_err() {
                    continue;
                }
                log.lock().unwrap().push(line.trim().to_string());
                let _ = writer.write_all(b"QUEUED\n").await;
            }
        });

        let results = tempfile::TempDir::new().unwrap();
        let repo_path = repo.path().to_path_buf();
        let results_path = results.path().to_path_buf();
        tokio::spawn(async move {
            let _ = run_observer(
                &repo_path,
                "HEAD",
                Duration::from_millis(50),
                &dispatcher,
                &results_path,
            )
            .await;
        });

        // several polls go by; the unchanged tip is submitted only once
        for _ in 0..200 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        sleep(Duration::from_millis(300)).await;

        let lines = seen.lock().unwrap().clone();
        let submissions: Vec<&String> = lines
            .iter()
            .filter(|line| line.starts_with("DISPATCH "))
            .collect();
        assert_eq!(submissions.len(), 1, "lines: {:?}", lines);
        assert!(lines.iter().any(|line| line == "STATUS"));
    }
}

