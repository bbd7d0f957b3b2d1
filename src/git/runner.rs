use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ForemanError, Result};

/// Async wrapper over the git CLI scoped to one working directory.
///
/// The integration plane runs every ref mutation through this type so
/// failures surface as structured errors with captured stderr.
#[derive(Debug, Clone)]
pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn with_dir(&self, dir: &Path) -> Self {
        Self::new(dir)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForemanError::Git(git2::Error::from_str(&stderr)));
        }

        Ok(output)
    }

    pub async fn clone_shared(&self, source: &Path, dest: &Path) -> Result<()> {
        let source_str = path_str(source)?;
        let dest_str = path_str(dest)?;
        self.run_checked(&["clone", "--shared", source_str, dest_str])
            .await?;
        Ok(())
    }

    pub async fn rev_parse(&self, rev: &str) -> Result<String> {
        let output = self.run_checked(&["rev-parse", rev]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self
            .run(&["rev-parse", "--verify", &format!("refs/heads/{}", branch)])
            .await?;
        Ok(output.status.success())
    }

    /// True when `ancestor` is reachable from `descendant`.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self
            .run(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        Ok(output.status.success())
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch]).await?;
        Ok(())
    }

    pub async fn create_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        self.run_checked(&["branch", branch, start_point]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<bool> {
        let output = self.run(&["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    /// Move a branch ref without touching the worktree. Used for branch
    /// bootstrap resets and for mc/green promotion, where the caller has
    /// already verified the new target is a fast-forward via `is_ancestor`.
    pub async fn update_ref(&self, branch: &str, target: &str) -> Result<()> {
        self.run_checked(&["update-ref", &format!("refs/heads/{}", branch), target])
            .await?;
        Ok(())
    }

    pub async fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        let output = self.run(&["merge", "--no-ff", branch, "-m", message]).await?;
        if !output.status.success() {
            let _ = self.run(&["merge", "--abort"]).await;
            let combined = merged_output(&output);
            return Err(ForemanError::MergeConflict(truncate(&combined, 500)));
        }
        Ok(())
    }

    pub async fn merge_ff_only(&self, branch: &str) -> Result<()> {
        let output = self.run(&["merge", "--ff-only", branch]).await?;
        if !output.status.success() {
            let combined = merged_output(&output);
            return Err(ForemanError::RefsDiverged(truncate(&combined, 500)));
        }
        Ok(())
    }

    pub async fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", rev]).await?;
        Ok(())
    }

    /// Remove untracked files and directories left by a failed attempt.
    pub async fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd"]).await?;
        Ok(())
    }

    pub async fn fetch(&self, remote: &str) -> Result<()> {
        self.run_checked(&["fetch", remote]).await?;
        Ok(())
    }

    /// Fetch a refspec from an arbitrary repository path (worker clones
    /// are addressed by path, not by configured remote).
    pub async fn fetch_refspec(&self, from: &Path, refspec: &str) -> Result<()> {
        let from_str = path_str(from)?;
        self.run_checked(&["fetch", from_str, refspec]).await?;
        Ok(())
    }

    pub async fn push(&self, remote: &str, refspec: &str, force_with_lease: bool) -> Result<()> {
        let output = if force_with_lease {
            self.run(&["push", "--force-with-lease", remote, refspec])
                .await?
        } else {
            self.run(&["push", remote, refspec]).await?
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForemanError::Git(git2::Error::from_str(&stderr)));
        }
        Ok(())
    }

    pub async fn diff_name_only(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let output = self
            .run_checked(&["diff", "--name-only", from, to])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn diff_stat(&self, from: &str, to: &str) -> Result<String> {
        let output = self.run_checked(&["diff", "--stat", from, to]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub async fn diff(&self, from: &str, to: &str) -> Result<String> {
        let output = self.run_checked(&["diff", from, to]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub async fn status_porcelain(&self) -> Result<String> {
        let output = self.run_checked(&["status", "--porcelain"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn merged_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    combined
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| ForemanError::Other("Invalid path encoding".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_repo() -> (TempDir, GitRunner) {
        let dir = TempDir::new().unwrap();
        let git = GitRunner::new(dir.path());
        git.run_checked(&["init", "-b", "main"]).await.unwrap();
        git.run_checked(&["config", "user.email", "test@example.com"])
            .await
            .unwrap();
        git.run_checked(&["config", "user.name", "test"])
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("README.md"), "hello\n")
            .await
            .unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", "init"]).await.unwrap();
        (dir, git)
    }

    #[tokio::test]
    async fn rev_parse_and_ancestry() {
        let (_dir, git) = init_repo().await;
        let head = git.rev_parse("HEAD").await.unwrap();
        assert_eq!(head.len(), 40);

        git.run_checked(&["commit", "--allow-empty", "-m", "second"])
            .await
            .unwrap();
        let new_head = git.rev_parse("HEAD").await.unwrap();
        assert!(git.is_ancestor(&head, &new_head).await.unwrap());
        assert!(!git.is_ancestor(&new_head, &head).await.unwrap());
    }

    #[tokio::test]
    async fn ff_only_merge_rejects_divergence() {
        let (dir, git) = init_repo().await;

        git.create_branch("feature", "HEAD").await.unwrap();
        git.checkout("feature").await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "a\n").await.unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", "feature work"])
            .await
            .unwrap();

        // Diverge main
        git.checkout("main").await.unwrap();
        tokio::fs::write(dir.path().join("b.txt"), "b\n").await.unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", "main work"]).await.unwrap();

        let err = git.merge_ff_only("feature").await.unwrap_err();
        assert!(matches!(err, ForemanError::RefsDiverged(_)));
    }

    #[tokio::test]
    async fn merge_conflict_is_aborted_and_classified() {
        let (dir, git) = init_repo().await;

        git.create_branch("feature", "HEAD").await.unwrap();
        git.checkout("feature").await.unwrap();
        tokio::fs::write(dir.path().join("README.md"), "feature\n")
            .await
            .unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", "feature edit"])
            .await
            .unwrap();

        git.checkout("main").await.unwrap();
        tokio::fs::write(dir.path().join("README.md"), "main\n")
            .await
            .unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", "main edit"]).await.unwrap();

        let err = git.merge_no_ff("feature", "merge feature").await.unwrap_err();
        assert!(matches!(err, ForemanError::MergeConflict(_)));

        // Aborted merge leaves a clean tree
        let status = git.status_porcelain().await.unwrap();
        assert!(status.trim().is_empty(), "dirty after abort: {}", status);
    }

    #[tokio::test]
    async fn fetch_refspec_from_path() {
        let (dir, git) = init_repo().await;
        let clone_dir = TempDir::new().unwrap();
        let clone_path = clone_dir.path().join("clone");
        git.clone_shared(dir.path(), &clone_path).await.unwrap();

        let clone_git = git.with_dir(&clone_path);
        clone_git
            .run_checked(&["config", "user.email", "test@example.com"])
            .await
            .unwrap();
        clone_git
            .run_checked(&["config", "user.name", "test"])
            .await
            .unwrap();
        clone_git
            .run_checked(&["checkout", "-b", "mc/unit-abc"])
            .await
            .unwrap();
        clone_git
            .run_checked(&["commit", "--allow-empty", "-m", "unit work"])
            .await
            .unwrap();

        git.fetch_refspec(&clone_path, "+mc/unit-abc:mc/unit-abc")
            .await
            .unwrap();
        assert!(git.branch_exists("mc/unit-abc").await.unwrap());
    }
}
