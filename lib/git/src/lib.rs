use std::{
  path::{Path, PathBuf},
  process::Output,
};

use anyhow::{Context, anyhow};
use tempfile::TempDir;

/// A repository checkout living in a temp directory. The directory is
/// removed when the checkout is dropped, on every exit path.
pub struct ScopedCheckout {
  dir: TempDir,
}

impl ScopedCheckout {
  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// Path to a subdirectory of the checkout.
  pub fn join(&self, sub: &str) -> PathBuf {
    self.dir.path().join(sub)
  }
}

/// Clones `repo_url` into a fresh temp directory and returns the scoped
/// checkout. Cleanup happens on drop.
pub async fn clone_into_temp(
  repo_url: &str,
) -> anyhow::Result<ScopedCheckout> {
  let dir = TempDir::with_prefix("pulp-manager-")
    .context("failed to create temp directory for clone")?;

  tracing::info!("cloning {repo_url} into {:?}", dir.path());

  let output = run_git(
    &["clone", "--depth", "1", repo_url, "."],
    dir.path(),
  )
  .await?;

  if !output.status.success() {
    return Err(anyhow!(
      "git clone failed | {}",
      String::from_utf8_lossy(&output.stderr).trim()
    ));
  }

  Ok(ScopedCheckout { dir })
}

/// Short hash of HEAD for a checkout, used to stamp registration runs.
pub async fn commit_hash(repo_dir: &Path) -> anyhow::Result<String> {
  let output =
    run_git(&["rev-parse", "--short", "HEAD"], repo_dir).await?;
  if !output.status.success() {
    return Err(anyhow!(
      "failed to get short hash | {}",
      String::from_utf8_lossy(&output.stderr).trim()
    ));
  }
  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn run_git(
  args: &[&str],
  cwd: &Path,
) -> anyhow::Result<Output> {
  tokio::process::Command::new("git")
    .args(args)
    .current_dir(cwd)
    .output()
    .await
    .with_context(|| format!("failed to spawn git {args:?}"))
}
