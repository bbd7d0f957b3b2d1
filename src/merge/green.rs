//! Green branch manager: owns `mc/working` and `mc/green`.
//!
//! Submissions merge into `mc/working`, pass the verification and
//! acceptance gates, then `mc/green` fast-forwards to the result. Any gate
//! failure hard-resets `mc/working` back to its pre-merge head, so a
//! failed submission leaves both refs exactly as it found them.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{AutoPushPolicy, GreenBranchConfig, VerificationConfig};
use crate::error::{ForemanError, Result};
use crate::git::GitRunner;
use crate::limits::{BreakerOutcome, CircuitBreakerSet};

use super::queue::MergeSubmission;

pub const GREEN_BRANCH_COMPONENT: &str = "green_branch";
pub const PUSH_COMPONENT: &str = "push";

/// Push-tracking ref, force-updated from mc/green before every push.
pub const GREEN_PUSH_REF: &str = "refs/mc/green-push";

/// Result of pushing one submission through the gate pipeline.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Merged, verified, promoted to mc/green.
    Completed {
        merge_commit: String,
        changed_files: Vec<String>,
        criteria_passed: bool,
    },
    /// The branch was already an ancestor of mc/green.
    AlreadyMerged,
    /// A gate failed; mc/working was reset to its pre-merge head.
    RolledBack { stage: &'static str, output: String },
    /// Infrastructure failure or open breaker; the submission is dropped.
    Abandoned { reason: String },
}

pub struct GreenBranchManager {
    green: GreenBranchConfig,
    verification: VerificationConfig,
    verify_before_merge: bool,
    base_branch: String,
    /// Integration workspace clone; the single writer to both refs.
    git: GitRunner,
    source_git: GitRunner,
    breakers: Arc<CircuitBreakerSet>,
    merges_since_push: parking_lot::Mutex<u32>,
}

impl GreenBranchManager {
    pub fn new(
        green: GreenBranchConfig,
        verification: VerificationConfig,
        verify_before_merge: bool,
        base_branch: impl Into<String>,
        workspace: impl Into<PathBuf>,
        source_repo: impl Into<PathBuf>,
        breakers: Arc<CircuitBreakerSet>,
    ) -> Self {
        Self {
            green,
            verification,
            verify_before_merge,
            base_branch: base_branch.into(),
            git: GitRunner::new(workspace),
            source_git: GitRunner::new(source_repo),
            breakers,
            merges_since_push: parking_lot::Mutex::new(0),
        }
    }

    pub fn workspace(&self) -> &Path {
        self.git.working_dir()
    }

    pub fn green_branch(&self) -> &str {
        &self.green.green_branch
    }

    pub fn verification_command(&self) -> &str {
        &self.verification.command
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification.timeout_secs)
    }

    /// Bootstrap the integration branches in both the source repo (worker
    /// clones fetch from it) and the integration workspace, then run the
    /// optional workspace setup command.
    pub async fn initialize(&self) -> Result<()> {
        let gb = &self.green;

        // Flush unpushed green work before a reset discards the ref.
        if gb.reset_on_init
            && gb.auto_push
            && self.source_git.branch_exists(&gb.green_branch).await?
        {
            let ahead = self
                .source_git
                .run(&[
                    "rev-list",
                    "--count",
                    &format!("{}..{}", self.base_branch, gb.green_branch),
                ])
                .await?;
            let count = String::from_utf8_lossy(&ahead.stdout).trim().to_string();
            if !count.is_empty() && count != "0" {
                warn!(unpushed = %count, "mc/green has unpushed commits, pushing before reset");
                if let Err(e) = self.push_green().await {
                    warn!(error = %e, "Pre-reset push failed");
                }
            }
        }

        for branch in [&gb.working_branch, &gb.green_branch] {
            if !self.source_git.branch_exists(branch).await? {
                info!(%branch, base = %self.base_branch, "Creating integration branch in source repo");
                self.source_git
                    .create_branch(branch, &self.base_branch)
                    .await?;
            } else if gb.reset_on_init {
                info!(%branch, base = %self.base_branch, "Resetting integration branch in source repo");
                self.source_git.update_ref(branch, &self.base_branch).await?;
            }
        }

        // Mirror the refs into the integration workspace.
        self.git.fetch("origin").await?;
        self.git.checkout(&self.base_branch).await?;
        for branch in [&gb.working_branch, &gb.green_branch] {
            let origin_ref = format!("origin/{}", branch);
            if self.git.branch_exists(branch).await? {
                self.git.update_ref(branch, &origin_ref).await?;
            } else {
                self.git.create_branch(branch, &origin_ref).await?;
            }
        }
        self.git.checkout(&gb.working_branch).await?;

        if !self.verification.setup_command.is_empty() {
            info!(command = %self.verification.setup_command, "Running workspace setup");
            let (ok, output) = run_shell(
                self.git.working_dir(),
                &self.verification.setup_command,
                Duration::from_secs(self.verification.setup_timeout_secs),
            )
            .await;
            if !ok {
                return Err(ForemanError::Workspace {
                    message: format!("setup command failed: {}", truncate(&output, 500)),
                    path: self.git.working_dir().to_path_buf(),
                });
            }
        }

        Ok(())
    }

    pub async fn green_hash(&self) -> Result<String> {
        self.git.rev_parse(&self.green.green_branch).await
    }

    /// Unified diff a merge commit introduced, for the reviewer.
    pub async fn diff_for(&self, merge_commit: &str) -> Result<String> {
        self.git
            .diff(&format!("{}^1", merge_commit), merge_commit)
            .await
    }

    /// Run one submission through the pipeline. Content failures come back
    /// as `RolledBack`; plumbing failures trip the green_branch breaker
    /// and abandon the submission.
    pub async fn process(
        &self,
        submission: &MergeSubmission,
        acceptance_criteria: &[String],
    ) -> MergeOutcome {
        if !self.breakers.allow(GREEN_BRANCH_COMPONENT) {
            return MergeOutcome::Abandoned {
                reason: "green_branch circuit open".into(),
            };
        }

        match self.pipeline(submission, acceptance_criteria).await {
            Ok(outcome) => {
                self.breakers
                    .record(GREEN_BRANCH_COMPONENT, BreakerOutcome::Success);
                outcome
            }
            Err(e) => {
                warn!(
                    unit_id = %submission.unit_id,
                    error = %e,
                    "Submission abandoned on integration error"
                );
                self.breakers
                    .record(GREEN_BRANCH_COMPONENT, BreakerOutcome::Failure);
                MergeOutcome::Abandoned {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn pipeline(
        &self,
        submission: &MergeSubmission,
        acceptance_criteria: &[String],
    ) -> Result<MergeOutcome> {
        let gb = &self.green;
        let branch = &submission.branch_ref;

        // Branches created inside the integration workspace (fixup
        // winners) are already local; everything else is fetched from the
        // submitting clone.
        if submission.workspace != self.git.working_dir() {
            self.git
                .fetch_refspec(&submission.workspace, &format!("+{0}:{0}", branch))
                .await?;
        }

        // Idempotent re-merge: already part of the verified line.
        if self.git.is_ancestor(branch, &gb.green_branch).await? {
            debug!(%branch, "Branch already on mc/green, completing idempotently");
            return Ok(MergeOutcome::AlreadyMerged);
        }

        self.git.checkout(&gb.working_branch).await?;
        self.git.reset_hard("HEAD").await?;
        self.git.clean_untracked().await?;
        let pre_merge = self.git.rev_parse(&gb.working_branch).await?;

        match self
            .git
            .merge_no_ff(branch, &format!("Merge {} into {}", branch, gb.working_branch))
            .await
        {
            Ok(()) => {}
            Err(ForemanError::MergeConflict(output)) => {
                return Ok(MergeOutcome::RolledBack {
                    stage: "merge_conflict",
                    output,
                });
            }
            Err(e) => return Err(e),
        }
        let merge_commit = self.git.rev_parse("HEAD").await?;

        if self.verify_before_merge {
            let (passed, output) = self.run_verification().await;
            if !passed {
                warn!(%branch, "Pre-merge verification failed, rolling back");
                self.rollback(&pre_merge).await?;
                return Ok(MergeOutcome::RolledBack {
                    stage: "pre_merge_verification",
                    output: truncate(&output, 2000),
                });
            }
        }

        for criterion in acceptance_criteria {
            let (passed, output) = run_shell(
                self.git.working_dir(),
                criterion,
                Duration::from_secs(self.verification.timeout_secs),
            )
            .await;
            if !passed {
                warn!(%branch, %criterion, "Acceptance criterion failed, rolling back");
                self.rollback(&pre_merge).await?;
                return Ok(MergeOutcome::RolledBack {
                    stage: "acceptance_criteria",
                    output: truncate(&output, 2000),
                });
            }
        }
        let criteria_passed = !acceptance_criteria.is_empty();

        // Promote: mc/green only ever advances along mc/working's history.
        if !self
            .git
            .is_ancestor(&gb.green_branch, &gb.working_branch)
            .await?
        {
            return Err(ForemanError::RefsDiverged(format!(
                "{} is not an ancestor of {}",
                gb.green_branch, gb.working_branch
            )));
        }
        self.git.update_ref(&gb.green_branch, &merge_commit).await?;
        info!(%branch, commit = %&merge_commit[..8.min(merge_commit.len())], "Promoted to mc/green");

        let changed_files = self
            .git
            .diff_name_only(&pre_merge, &merge_commit)
            .await
            .unwrap_or_default();

        if let Err(e) = self.sync_to_source().await {
            warn!(error = %e, "Failed to sync integration refs to source repo");
        }

        if gb.auto_push {
            *self.merges_since_push.lock() += 1;
            if let Err(e) = self.maybe_push(false).await {
                // A promoted unit stays promoted; push trouble is logged
                // and recorded on its own breaker.
                warn!(error = %e, "Auto-push failed");
            }
        }

        Ok(MergeOutcome::Completed {
            merge_commit,
            changed_files,
            criteria_passed,
        })
    }

    /// Reset mc/working to the pre-merge head and drop any residue from
    /// the failed attempt.
    async fn rollback(&self, pre_merge: &str) -> Result<()> {
        self.git.checkout(&self.green.working_branch).await?;
        self.git.reset_hard(pre_merge).await?;
        self.git.clean_untracked().await?;
        Ok(())
    }

    pub async fn run_verification(&self) -> (bool, String) {
        run_shell(
            self.git.working_dir(),
            &self.verification.command,
            Duration::from_secs(self.verification.timeout_secs),
        )
        .await
    }

    /// Force-fetch the integration refs back into the source repo so the
    /// next worker clone starts from the merged state.
    async fn sync_to_source(&self) -> Result<()> {
        for branch in [&self.green.green_branch, &self.green.working_branch] {
            self.source_git
                .fetch_refspec(self.git.working_dir(), &format!("+{0}:{0}", branch))
                .await?;
        }
        Ok(())
    }

    /// Push when enough promotions accumulated, or unconditionally with
    /// `force`. Returns true when a push happened.
    pub async fn maybe_push(&self, force: bool) -> Result<bool> {
        if !self.green.auto_push {
            return Ok(false);
        }
        let due = {
            let count = self.merges_since_push.lock();
            force || *count >= self.green.push_batch_size
        };
        if !due {
            return Ok(false);
        }
        match self.push_green().await {
            Ok(pushed) => {
                if pushed {
                    *self.merges_since_push.lock() = 0;
                }
                Ok(pushed)
            }
            Err(e) => Err(e),
        }
    }

    /// Stage mc/green into the push-tracking ref and push it to the
    /// configured upstream branch, honouring the divergence policy.
    pub async fn push_green(&self) -> Result<bool> {
        if !self.breakers.allow(PUSH_COMPONENT) {
            warn!("Push circuit open, skipping push");
            return Ok(false);
        }

        let result = self.push_green_inner().await;
        match &result {
            Ok(true) => self.breakers.record(PUSH_COMPONENT, BreakerOutcome::Success),
            Ok(false) => {}
            Err(_) => self.breakers.record(PUSH_COMPONENT, BreakerOutcome::Failure),
        }
        result
    }

    async fn push_green_inner(&self) -> Result<bool> {
        let gb = &self.green;

        self.source_git
            .fetch_refspec(
                self.git.working_dir(),
                &format!("+{}:{}", gb.green_branch, GREEN_PUSH_REF),
            )
            .await?;

        if let Err(e) = self.source_git.fetch("origin").await {
            warn!(error = %e, "Fetch of origin before push failed");
        }

        let upstream = format!("origin/{}", gb.push_branch);
        let refspec = format!("{}:refs/heads/{}", GREEN_PUSH_REF, gb.push_branch);
        let upstream_exists = self.source_git.rev_parse(&upstream).await.is_ok();

        if !upstream_exists
            || self
                .source_git
                .is_ancestor(&upstream, GREEN_PUSH_REF)
                .await?
        {
            self.source_git.push("origin", &refspec, false).await?;
            info!(branch = %gb.push_branch, "Pushed mc/green to origin");
            return Ok(true);
        }

        match gb.auto_push_policy {
            AutoPushPolicy::Abort => {
                warn!(
                    upstream = %upstream,
                    "Upstream diverged from mc/green, push aborted by policy"
                );
                Ok(false)
            }
            AutoPushPolicy::Force => {
                self.source_git.push("origin", &refspec, true).await?;
                info!(branch = %gb.push_branch, "Force-pushed mc/green to origin");
                Ok(true)
            }
            AutoPushPolicy::Merge => self.push_with_merge().await,
        }
    }

    /// Merge the diverged upstream into the push branch in the source repo
    /// before pushing. The operator's checkout is stashed around the
    /// detour and restored afterwards.
    async fn push_with_merge(&self) -> Result<bool> {
        let gb = &self.green;

        let head = self
            .source_git
            .run_checked(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        let original_branch = String::from_utf8_lossy(&head.stdout).trim().to_string();

        let stash_out = self
            .source_git
            .run_checked(&["stash", "--include-untracked"])
            .await?;
        let stashed =
            !String::from_utf8_lossy(&stash_out.stdout).contains("No local changes");

        let result = async {
            self.source_git.checkout(&gb.push_branch).await?;
            let _ = self
                .source_git
                .run(&["pull", "--rebase", "origin", &gb.push_branch])
                .await;
            self.source_git
                .run_checked(&["merge", "--no-edit", GREEN_PUSH_REF])
                .await?;
            self.source_git
                .push("origin", &format!("refs/heads/{0}:refs/heads/{0}", gb.push_branch), false)
                .await?;
            Ok::<bool, ForemanError>(true)
        }
        .await;

        if original_branch != "HEAD" && !original_branch.is_empty() {
            let _ = self.source_git.checkout(&original_branch).await;
        }
        if stashed {
            let _ = self.source_git.run(&["stash", "pop"]).await;
        }

        result
    }
}

/// Run a shell command with a hard timeout; on timeout the process group
/// is killed and the command counts as failed.
pub(crate) async fn run_shell(dir: &Path, command: &str, timeout: Duration) -> (bool, String) {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return (false, format!("failed to launch shell: {}", e)),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&stderr);
            }
            (output.status.success(), combined)
        }
        Ok(Err(e)) => (false, format!("command wait failed: {}", e)),
        Err(_) => (
            false,
            format!("command timed out after {}s: {}", timeout.as_secs(), command),
        ),
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ResultEnvelope;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        manager: GreenBranchManager,
        worker_clone: PathBuf,
    }

    async fn git_in(dir: &Path) -> GitRunner {
        let git = GitRunner::new(dir);
        git.run_checked(&["config", "user.email", "test@example.com"])
            .await
            .unwrap();
        git.run_checked(&["config", "user.name", "test"])
            .await
            .unwrap();
        git
    }

    async fn fixture(verification_command: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        tokio::fs::create_dir_all(&source).await.unwrap();
        let source_git = GitRunner::new(&source);
        source_git.run_checked(&["init", "-b", "main"]).await.unwrap();
        let source_git = git_in(&source).await;
        tokio::fs::write(source.join("base.txt"), "base\n").await.unwrap();
        source_git.run_checked(&["add", "-A"]).await.unwrap();
        source_git.run_checked(&["commit", "-m", "init"]).await.unwrap();

        // Integration workspace and worker clone both hang off the source.
        let integration = dir.path().join("integration");
        source_git.clone_shared(&source, &integration).await.unwrap();
        git_in(&integration).await;

        let mut green = GreenBranchConfig::default();
        green.auto_push = false;
        let verification = VerificationConfig {
            command: verification_command.into(),
            timeout_secs: 30,
            setup_command: String::new(),
            setup_timeout_secs: 30,
        };
        let breakers = Arc::new(CircuitBreakerSet::new(5, Duration::from_secs(60)));
        let manager = GreenBranchManager::new(
            green,
            verification,
            true,
            "main",
            &integration,
            &source,
            breakers,
        );
        manager.initialize().await.unwrap();

        let worker_clone = dir.path().join("worker");
        source_git.clone_shared(&source, &worker_clone).await.unwrap();
        git_in(&worker_clone).await;

        Fixture {
            _dir: dir,
            source,
            manager,
            worker_clone,
        }
    }

    /// Commit `content` to `file` on a fresh unit branch in the worker
    /// clone and return a submission for it.
    async fn worker_submission(fx: &Fixture, branch: &str, file: &str, content: &str) -> MergeSubmission {
        let git = GitRunner::new(&fx.worker_clone);
        git.fetch("origin").await.unwrap();
        git.run_checked(&["checkout", "-B", branch, "origin/mc/green"])
            .await
            .unwrap();
        tokio::fs::write(fx.worker_clone.join(file), content).await.unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", &format!("unit work on {}", file)])
            .await
            .unwrap();

        MergeSubmission {
            unit_id: branch.trim_start_matches("mc/unit-").to_string(),
            branch_ref: branch.to_string(),
            workspace: fx.worker_clone.clone(),
            envelope: ResultEnvelope::default(),
            submitted_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn clean_submission_promotes_green() {
        let fx = fixture("true").await;
        let green_before = fx.manager.green_hash().await.unwrap();

        let submission = worker_submission(&fx, "mc/unit-one", "feature.txt", "new\n").await;
        let outcome = fx.manager.process(&submission, &[]).await;

        match outcome {
            MergeOutcome::Completed { changed_files, criteria_passed, .. } => {
                assert_eq!(changed_files, vec!["feature.txt".to_string()]);
                assert!(!criteria_passed);
            }
            other => panic!("expected Completed, got {:?}", other),
        }

        let green_after = fx.manager.green_hash().await.unwrap();
        assert_ne!(green_before, green_after);

        // Promotion was a fast-forward.
        let git = GitRunner::new(fx.manager.workspace());
        assert!(git.is_ancestor(&green_before, &green_after).await.unwrap());

        // Refs were synced back to the source repo.
        let source_git = GitRunner::new(&fx.source);
        assert_eq!(source_git.rev_parse("mc/green").await.unwrap(), green_after);
    }

    #[tokio::test]
    async fn resubmission_is_idempotent() {
        let fx = fixture("true").await;
        let submission = worker_submission(&fx, "mc/unit-dup", "dup.txt", "x\n").await;

        let first = fx.manager.process(&submission, &[]).await;
        assert!(matches!(first, MergeOutcome::Completed { .. }));
        let green_after_first = fx.manager.green_hash().await.unwrap();

        let second = fx.manager.process(&submission, &[]).await;
        assert!(matches!(second, MergeOutcome::AlreadyMerged));
        assert_eq!(fx.manager.green_hash().await.unwrap(), green_after_first);
    }

    #[tokio::test]
    async fn failed_verification_rolls_back_working() {
        // Verification fails exactly when the unit's file is present.
        let fx = fixture("test ! -f broken.txt").await;
        let green_before = fx.manager.green_hash().await.unwrap();
        let git = GitRunner::new(fx.manager.workspace());
        let working_before = git.rev_parse("mc/working").await.unwrap();

        let submission = worker_submission(&fx, "mc/unit-bad", "broken.txt", "boom\n").await;
        let outcome = fx.manager.process(&submission, &[]).await;

        match outcome {
            MergeOutcome::RolledBack { stage, .. } => {
                assert_eq!(stage, "pre_merge_verification");
            }
            other => panic!("expected RolledBack, got {:?}", other),
        }

        assert_eq!(git.rev_parse("mc/working").await.unwrap(), working_before);
        assert_eq!(fx.manager.green_hash().await.unwrap(), green_before);
        assert!(git.status_porcelain().await.unwrap().trim().is_empty());
    }

    #[tokio::test]
    async fn failed_acceptance_criterion_rolls_back() {
        let fx = fixture("true").await;
        let green_before = fx.manager.green_hash().await.unwrap();

        let submission = worker_submission(&fx, "mc/unit-ac", "ac.txt", "x\n").await;
        let criteria = vec!["test -f ac.txt".to_string(), "false".to_string()];
        let outcome = fx.manager.process(&submission, &criteria).await;

        match outcome {
            MergeOutcome::RolledBack { stage, .. } => assert_eq!(stage, "acceptance_criteria"),
            other => panic!("expected RolledBack, got {:?}", other),
        }
        assert_eq!(fx.manager.green_hash().await.unwrap(), green_before);
    }

    #[tokio::test]
    async fn passing_criteria_mark_submission_eligible_for_review_skip() {
        let fx = fixture("true").await;
        let submission = worker_submission(&fx, "mc/unit-ok", "ok.txt", "x\n").await;
        let criteria = vec!["test -f ok.txt".to_string()];
        let outcome = fx.manager.process(&submission, &criteria).await;

        match outcome {
            MergeOutcome::Completed { criteria_passed, .. } => assert!(criteria_passed),
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn conflicting_submission_rolls_back_cleanly() {
        let fx = fixture("true").await;

        // First unit lands a version of the file.
        let first = worker_submission(&fx, "mc/unit-a", "shared.txt", "version a\n").await;
        assert!(matches!(
            fx.manager.process(&first, &[]).await,
            MergeOutcome::Completed { .. }
        ));

        // Second unit edited the same file from the older base.
        let git = GitRunner::new(&fx.worker_clone);
        git.run_checked(&["checkout", "-B", "mc/unit-b", "mc/unit-a~1"])
            .await
            .unwrap();
        tokio::fs::write(fx.worker_clone.join("shared.txt"), "version b\n")
            .await
            .unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", "conflicting edit"])
            .await
            .unwrap();
        let conflicting = MergeSubmission {
            unit_id: "b".into(),
            branch_ref: "mc/unit-b".into(),
            workspace: fx.worker_clone.clone(),
            envelope: ResultEnvelope::default(),
            submitted_at: Instant::now(),
        };

        let green_before = fx.manager.green_hash().await.unwrap();
        let outcome = fx.manager.process(&conflicting, &[]).await;
        match outcome {
            MergeOutcome::RolledBack { stage, .. } => assert_eq!(stage, "merge_conflict"),
            other => panic!("expected RolledBack, got {:?}", other),
        }
        assert_eq!(fx.manager.green_hash().await.unwrap(), green_before);

        let ig = GitRunner::new(fx.manager.workspace());
        assert!(ig.status_porcelain().await.unwrap().trim().is_empty());
    }

    #[tokio::test]
    async fn run_shell_times_out() {
        let dir = TempDir::new().unwrap();
        let (ok, output) = run_shell(dir.path(), "sleep 30", Duration::from_millis(100)).await;
        assert!(!ok);
        assert!(output.contains("timed out"));
    }
}
