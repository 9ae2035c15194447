//! Iteration checkpoints in the output directory.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use crate::state::Asset;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHandle(pub String);

impl std::fmt::Display for CommitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait Versioning: Send + Sync {
    async fn init(&self) -> Result<()>;

    /// Checkpoint the current output tree. `None` when there was nothing to
    /// record.
    async fn commit_iteration(&self, iteration: u32, assets: &[Asset])
    -> Result<Option<CommitHandle>>;

    /// Tag `target`, or the latest checkpoint when `None`.
    async fn tag(&self, name: &str, target: Option<&CommitHandle>) -> Result<()>;
}

pub fn iteration_tag(iteration: u32) -> String {
    format!("iteration-{iteration:03}")
}

pub fn best_iteration_tag(iteration: u32) -> String {
    format!("best-iteration-{iteration:03}")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoVersioning;

#[async_trait]
impl Versioning for NoVersioning {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn commit_iteration(
        &self,
        _iteration: u32,
        _assets: &[Asset],
    ) -> Result<Option<CommitHandle>> {
        Ok(None)
    }

    async fn tag(&self, _name: &str, _target: Option<&CommitHandle>) -> Result<()> {
        Ok(())
    }
}

/// Drives the `git` CLI inside the output directory.
#[derive(Debug)]
pub struct GitVersioning {
    repo_dir: PathBuf,
    ready: AtomicBool,
}

const GIT_IDENTITY: &[&str] = &[
    "-c",
    "user.name=MuseLoop",
    "-c",
    "user.email=museloop@localhost",
    "-c",
    "commit.gpgsign=false",
    "-c",
    "tag.gpgsign=false",
];

impl GitVersioning {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            ready: AtomicBool::new(false),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_dir)
            .args(GIT_IDENTITY)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Commit log, newest first, as `(hash, subject)` pairs.
    #[cfg(test)]
    async fn history(&self) -> Result<Vec<(String, String)>> {
        if !self.ready.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let log = self.git(&["log", "--format=%H %s"]).await?;
        Ok(log
            .lines()
            .filter_map(|line| line.split_once(' '))
            .map(|(hash, subject)| (hash.to_string(), subject.to_string()))
            .collect())
    }
}

#[async_trait]
impl Versioning for GitVersioning {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.repo_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create output directory '{}'",
                    self.repo_dir.display()
                )
            })?;

        if self.repo_dir.join(".git").exists() {
            tracing::info!(path = %self.repo_dir.display(), "opened existing output repository");
        } else {
            self.git(&["init", "-q"]).await?;
            self.git(&[
                "commit",
                "-q",
                "--allow-empty",
                "-m",
                "MuseLoop: initialize output repository",
            ])
            .await?;
            tracing::info!(path = %self.repo_dir.display(), "initialized output repository");
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_iteration(
        &self,
        iteration: u32,
        assets: &[Asset],
    ) -> Result<Option<CommitHandle>> {
        if !self.ready.load(Ordering::SeqCst) {
            return Ok(None);
        }

        self.git(&["add", "-A"]).await?;
        if self.git(&["status", "--porcelain"]).await?.is_empty() {
            tracing::info!(iteration, "nothing to commit");
            return Ok(None);
        }

        let message = format!(
            "MuseLoop iteration {iteration}: {} asset(s) generated",
            assets.len()
        );
        self.git(&["commit", "-q", "-m", &message]).await?;
        let handle = CommitHandle(self.git(&["rev-parse", "HEAD"]).await?);

        let tag = iteration_tag(iteration);
        if let Err(err) = self.git(&["tag", "-a", &tag, "-m", &message]).await {
            tracing::warn!(tag = %tag, error = %err, "iteration tag failed");
        }
        tracing::info!(iteration, commit = %handle, tag = %tag, "iteration committed");
        Ok(Some(handle))
    }

    async fn tag(&self, name: &str, target: Option<&CommitHandle>) -> Result<()> {
        if !self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut args = vec!["tag", "-a", name, "-m", name];
        if let Some(target) = target {
            args.push(target.0.as_str());
        }
        self.git(&args).await?;
        tracing::info!(tag = name, "tagged");
        Ok(())
    }
}
