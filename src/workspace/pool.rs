use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ForemanError, Result};
use crate::git::GitRunner;

/// Exclusive lease on one pool clone. The path is valid until `release`;
/// the pool never hands the same clone to two holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
struct PoolState {
    available: Vec<PathBuf>,
    in_use: HashSet<PathBuf>,
    total: usize,
}

/// Pool of `git clone --shared` copies of the source repository.
///
/// Shared clones hardlink into the source's object store, so creation is
/// near-instant and cheap on disk. Clones are recycled on release: checkout
/// the base branch first (so the reset cannot move a unit branch ref),
/// fetch, hard-reset to the freshest integration ref, clean untracked.
pub struct WorkspacePool {
    source_repo: PathBuf,
    pool_dir: PathBuf,
    max_clones: usize,
    base_branch: String,
    green_branch: String,
    state: tokio::sync::Mutex<PoolState>,
    released: Notify,
}

impl WorkspacePool {
    pub fn new(
        source_repo: impl Into<PathBuf>,
        pool_dir: impl Into<PathBuf>,
        max_clones: usize,
        base_branch: impl Into<String>,
        green_branch: impl Into<String>,
    ) -> Self {
        Self {
            source_repo: source_repo.into(),
            pool_dir: pool_dir.into(),
            max_clones,
            base_branch: base_branch.into(),
            green_branch: green_branch.into(),
            state: tokio::sync::Mutex::new(PoolState::default()),
            released: Notify::new(),
        }
    }

    /// Create the pool directory and pre-warm `warm_count` clones.
    pub async fn initialize(&self, warm_count: usize) -> Result<()> {
        tokio::fs::create_dir_all(&self.pool_dir).await?;
        for _ in 0..warm_count.min(self.max_clones) {
            let clone = self.create_clone().await?;
            let mut state = self.state.lock().await;
            state.available.push(clone);
            state.total += 1;
        }
        Ok(())
    }

    pub async fn available_slots(&self) -> usize {
        let state = self.state.lock().await;
        self.max_clones - state.in_use.len()
    }

    /// Lease a clone, creating one if under the cap, waiting otherwise.
    /// Times out with `PoolExhausted`.
    pub async fn acquire(&self, timeout: Duration) -> Result<WorkspaceHandle> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking, so a release landing
            // between the check and the await cannot be missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if let Some(path) = state.available.pop() {
                    state.in_use.insert(path.clone());
                    debug!(path = %path.display(), "Workspace acquired from pool");
                    return Ok(handle_for(path));
                }
                if state.total < self.max_clones {
                    // Reserve the slot before the clone so concurrent
                    // acquirers cannot overshoot max_clones.
                    state.total += 1;
                    drop(state);
                    match self.create_clone().await {
                        Ok(path) => {
                            let mut state = self.state.lock().await;
                            state.in_use.insert(path.clone());
                            return Ok(handle_for(path));
                        }
                        Err(e) => {
                            let mut state = self.state.lock().await;
                            state.total -= 1;
                            return Err(e);
                        }
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ForemanError::PoolExhausted {
                    waited_secs: timeout.as_secs(),
                });
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(ForemanError::PoolExhausted {
                    waited_secs: timeout.as_secs(),
                });
            }
        }
    }

    /// Return a clone to the pool. The clone is recycled before it becomes
    /// available again, so dirty state is never reissued.
    pub async fn release(&self, handle: WorkspaceHandle) -> Result<()> {
        {
            let state = self.state.lock().await;
            if !state.in_use.contains(&handle.path) {
                warn!(path = %handle.path.display(), "Release of unknown workspace ignored");
                return Ok(());
            }
        }

        let recycle_result = self.recycle(&handle).await;

        let mut state = self.state.lock().await;
        state.in_use.remove(&handle.path);
        match recycle_result {
            Ok(()) => {
                state.available.push(handle.path);
            }
            Err(e) => {
                // A clone that failed to reset is retired rather than
                // reissued dirty.
                warn!(path = %handle.path.display(), error = %e, "Retiring unrecyclable workspace");
                state.total -= 1;
                drop(state);
                let _ = tokio::fs::remove_dir_all(&handle.path).await;
            }
        }
        self.released.notify_waiters();
        Ok(())
    }

    /// Hard-reset a clone to the freshest integration state: checkout the
    /// base branch (detaching from any unit branch so the reset cannot
    /// destroy its ref), fetch, reset to origin's green branch when it
    /// exists, else the base branch, then drop untracked files.
    pub async fn recycle(&self, handle: &WorkspaceHandle) -> Result<()> {
        let git = GitRunner::new(&handle.path);

        git.checkout(&self.base_branch).await?;
        git.fetch("origin").await?;

        let green_ref = format!("origin/{}", self.green_branch);
        let reset_ref = if git.rev_parse(&green_ref).await.is_ok() {
            green_ref
        } else {
            format!("origin/{}", self.base_branch)
        };

        git.reset_hard(&reset_ref).await?;
        git.run_checked(&["clean", "-fdx"]).await?;
        debug!(path = %handle.path.display(), %reset_ref, "Workspace recycled");
        Ok(())
    }

    /// Delete every clone and the pool directory.
    pub async fn teardown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let paths: Vec<PathBuf> = {
            let s = &mut *state;
            s.available.drain(..).chain(s.in_use.drain()).collect()
        };
        for path in paths {
            let _ = tokio::fs::remove_dir_all(&path).await;
        }
        state.total = 0;
        drop(state);
        if self.pool_dir.exists() {
            tokio::fs::remove_dir_all(&self.pool_dir).await?;
        }
        Ok(())
    }

    async fn create_clone(&self) -> Result<PathBuf> {
        let name = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let clone_path = self.pool_dir.join(name);

        let git = GitRunner::new(&self.pool_dir);
        git.clone_shared(&self.source_repo, &clone_path)
            .await
            .map_err(|e| ForemanError::Workspace {
                message: format!("shared clone failed: {}", e),
                path: clone_path.clone(),
            })?;

        info!(path = %clone_path.display(), "Created shared clone");
        Ok(clone_path)
    }
}

fn handle_for(path: PathBuf) -> WorkspaceHandle {
    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    WorkspaceHandle { id, path }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn source_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("source");
        tokio::fs::create_dir_all(&repo).await.unwrap();
        let git = GitRunner::new(&repo);
        git.run_checked(&["init", "-b", "main"]).await.unwrap();
        git.run_checked(&["config", "user.email", "test@example.com"])
            .await
            .unwrap();
        git.run_checked(&["config", "user.name", "test"])
            .await
            .unwrap();
        tokio::fs::write(repo.join("file.txt"), "base\n").await.unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", "init"]).await.unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn acquire_release_cycle() {
        let (dir, repo) = source_repo().await;
        let pool = WorkspacePool::new(&repo, dir.path().join("pool"), 2, "main", "mc/green");
        pool.initialize(0).await.unwrap();

        let h1 = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let h2 = pool.acquire(Duration::from_secs(5)).await.unwrap();
        assert_ne!(h1.path, h2.path);
        assert_eq!(pool.available_slots().await, 0);

        pool.release(h1).await.unwrap();
        assert_eq!(pool.available_slots().await, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let (dir, repo) = source_repo().await;
        let pool = WorkspacePool::new(&repo, dir.path().join("pool"), 1, "main", "mc/green");
        pool.initialize(0).await.unwrap();

        let _held = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ForemanError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn release_unblocks_waiter() {
        let (dir, repo) = source_repo().await;
        let pool = std::sync::Arc::new(WorkspacePool::new(
            &repo,
            dir.path().join("pool"),
            1,
            "main",
            "mc/green",
        ));
        pool.initialize(0).await.unwrap();

        let held = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let pool2 = std::sync::Arc::clone(&pool);
        let waiter =
            tokio::spawn(async move { pool2.acquire(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.release(held).await.unwrap();

        let handle = waiter.await.unwrap().unwrap();
        pool.release(handle).await.unwrap();
    }

    #[tokio::test]
    async fn recycle_restores_base_state() {
        let (dir, repo) = source_repo().await;
        let pool = WorkspacePool::new(&repo, dir.path().join("pool"), 1, "main", "mc/green");
        pool.initialize(1).await.unwrap();

        let handle = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let base_head = GitRunner::new(&repo).rev_parse("HEAD").await.unwrap();

        // Dirty the clone: new branch, commit, untracked file.
        let git = GitRunner::new(&handle.path);
        git.run_checked(&["config", "user.email", "w@example.com"])
            .await
            .unwrap();
        git.run_checked(&["config", "user.name", "w"]).await.unwrap();
        git.run_checked(&["checkout", "-b", "mc/unit-xyz"])
            .await
            .unwrap();
        tokio::fs::write(handle.path.join("file.txt"), "changed\n")
            .await
            .unwrap();
        git.run_checked(&["commit", "-am", "unit work"]).await.unwrap();
        tokio::fs::write(handle.path.join("junk.tmp"), "junk")
            .await
            .unwrap();

        let path = handle.path.clone();
        pool.release(handle).await.unwrap();

        let reacquired = pool.acquire(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reacquired.path, path);
        let git = GitRunner::new(&reacquired.path);
        assert_eq!(git.rev_parse("HEAD").await.unwrap(), base_head);
        assert!(git.status_porcelain().await.unwrap().trim().is_empty());
        assert!(!reacquired.path.join("junk.tmp").exists());
    }

    #[tokio::test]
    async fn unit_branch_survives_recycle() {
        // The recycle checks out the base branch before resetting, so the
        // unit branch ref still points at the worker's commit afterwards.
        let (dir, repo) = source_repo().await;
        let pool = WorkspacePool::new(&repo, dir.path().join("pool"), 1, "main", "mc/green");
        pool.initialize(1).await.unwrap();

        let handle = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let git = GitRunner::new(&handle.path);
        git.run_checked(&["config", "user.email", "w@example.com"])
            .await
            .unwrap();
        git.run_checked(&["config", "user.name", "w"]).await.unwrap();
        git.run_checked(&["checkout", "-b", "mc/unit-keep"])
            .await
            .unwrap();
        git.run_checked(&["commit", "--allow-empty", "-m", "keep me"])
            .await
            .unwrap();
        let unit_head = git.rev_parse("mc/unit-keep").await.unwrap();

        pool.recycle(&handle).await.unwrap();
        assert_eq!(git.rev_parse("mc/unit-keep").await.unwrap(), unit_head);
        pool.release(handle).await.unwrap();
    }
}
