//! N-of-M fixup: parallel candidate generation with tournament selection.
//!
//! When a merge or gate fails with retries remaining, N workers each try a
//! different repair strategy in their own clones. Candidates that pass
//! verification enter a lexicographic tournament: most tests passed, then
//! fewest lint errors, then smallest diff, ties broken by submission
//! order. The winner merges as if it had been the original submission.

use std::cmp::Reverse;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use crate::domain::WorkUnit;
use crate::error::Result;
use crate::git::GitRunner;
use crate::workspace::{WorkspaceHandle, WorkspacePool};
use crate::worker::{WorkerBackend, WorkerRequest};

use super::green::{GreenBranchManager, run_shell};

/// Prompt variants rotated across candidates; each pushes the fix in a
/// different direction so the tournament has real choices.
pub const FIXUP_PROMPTS: [&str; 3] = [
    "Fix the failing verification by modifying the implementation code. Do NOT change any test files.",
    "Fix by adjusting the test expectations to match the current implementation behavior.",
    "Fix by refactoring the surrounding code to make both tests and implementation consistent.",
];

#[derive(Debug, Clone)]
pub struct FixupCandidate {
    pub index: usize,
    pub branch: String,
    pub verification_passed: bool,
    pub tests_passed: u32,
    pub lint_errors: u32,
    pub diff_lines: u32,
}

#[derive(Debug)]
pub struct FixupRun {
    pub candidates: Vec<FixupCandidate>,
    pub winner: Option<FixupCandidate>,
    /// Clone holding the winner's objects; the caller releases it after
    /// the winner's merge resolves.
    pub winner_workspace: Option<WorkspaceHandle>,
}

impl FixupRun {
    pub fn succeeded(&self) -> bool {
        self.winner.is_some()
    }
}

/// Tournament selection over the passing candidates.
pub fn select_winner(candidates: &[FixupCandidate]) -> Option<&FixupCandidate> {
    candidates
        .iter()
        .filter(|c| c.verification_passed)
        .min_by_key(|c| (Reverse(c.tests_passed), c.lint_errors, c.diff_lines, c.index))
}

static TESTS_PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+passed").expect("static regex"));

/// Pull coarse metrics out of verification output: the last "N passed"
/// count, and a line-count of tool error lines. Heuristic over common
/// test/lint runners; absent markers read as zero.
pub fn parse_verify_metrics(output: &str) -> (u32, u32) {
    let tests_passed = TESTS_PASSED_RE
        .captures_iter(output)
        .last()
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);

    let lint_errors = output
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with("error:") || t.starts_with("error[")
        })
        .count() as u32;

    (tests_passed, lint_errors)
}

/// Total insertions plus deletions from `git diff --stat` output.
pub fn count_diff_lines(diff_stat: &str) -> u32 {
    for line in diff_stat.lines().rev() {
        if !line.contains("changed") {
            continue;
        }
        let mut total = 0u32;
        for part in line.split(',') {
            let part = part.trim();
            if part.contains("insertion") || part.contains("deletion") {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                if let Ok(n) = digits.parse::<u32>() {
                    total += n;
                }
            }
        }
        return total;
    }
    0
}

impl GreenBranchManager {
    /// Run the N-of-M fixup for a failed unit. Candidates execute
    /// concurrently in their own clones; losers' workspaces are recycled
    /// before return.
    pub async fn run_fixup(
        &self,
        unit: &WorkUnit,
        failure_output: &str,
        pool: &WorkspacePool,
        backend: &dyn WorkerBackend,
        candidates: usize,
        session_timeout: Duration,
    ) -> Result<FixupRun> {
        let attempts: Vec<_> = (0..candidates)
            .map(|i| self.run_fixup_candidate(unit, failure_output, pool, backend, i, session_timeout))
            .collect();

        let results = futures::future::join_all(attempts).await;

        let mut all = Vec::new();
        let mut handles: Vec<Option<WorkspaceHandle>> = Vec::new();
        for (candidate, handle) in results {
            all.push(candidate);
            handles.push(handle);
        }

        let winner = select_winner(&all).cloned();
        if let Some(ref w) = winner {
            info!(
                branch = %w.branch,
                tests_passed = w.tests_passed,
                lint_errors = w.lint_errors,
                diff_lines = w.diff_lines,
                "Fixup tournament selected a winner"
            );
        } else {
            warn!(candidates = all.len(), "All fixup candidates failed verification");
        }

        // Release every clone except the winner's.
        let winner_index = winner.as_ref().map(|w| w.index);
        let mut winner_workspace = None;
        for (candidate, handle) in all.iter().zip(handles.into_iter()) {
            let Some(handle) = handle else { continue };
            if Some(candidate.index) == winner_index {
                winner_workspace = Some(handle);
            } else {
                let _ = pool.release(handle).await;
            }
        }

        Ok(FixupRun {
            candidates: all,
            winner,
            winner_workspace,
        })
    }

    async fn run_fixup_candidate(
        &self,
        unit: &WorkUnit,
        failure_output: &str,
        pool: &WorkspacePool,
        backend: &dyn WorkerBackend,
        index: usize,
        session_timeout: Duration,
    ) -> (FixupCandidate, Option<WorkspaceHandle>) {
        let branch = format!("mc/fixup-{}-{}", unit.id, index);
        let mut candidate = FixupCandidate {
            index,
            branch: branch.clone(),
            verification_passed: false,
            tests_passed: 0,
            lint_errors: 0,
            diff_lines: 0,
        };

        let handle = match pool.acquire(Duration::from_secs(60)).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(index, error = %e, "No workspace for fixup candidate");
                return (candidate, None);
            }
        };

        let git = GitRunner::new(&handle.path);
        let green_ref = format!("origin/{}", self.green_branch());
        let prepared = async {
            git.fetch("origin").await?;
            git.run_checked(&["checkout", "-B", &branch, &green_ref]).await?;
            Ok::<(), crate::error::ForemanError>(())
        }
        .await;
        if let Err(e) = prepared {
            warn!(index, error = %e, "Failed to prepare fixup branch");
            return (candidate, Some(handle));
        }

        let variant = FIXUP_PROMPTS[index % FIXUP_PROMPTS.len()];
        let prompt = format!(
            "{}\n\n## Verification Failure\n{}\n\n## Verification Command\n{}\n\n\
             Run the verification command after making changes. Commit your fix on \
             the current branch `{}` if verification passes.",
            variant,
            super::green::truncate(failure_output, 4000),
            self.verification_command(),
            branch,
        );

        let request = WorkerRequest {
            unit: unit.clone(),
            workspace: handle.path.clone(),
            branch_name: branch.clone(),
            prompt,
            timeout: session_timeout,
        };
        if let Err(e) = backend.spawn(&request).await {
            warn!(index, error = %e, "Fixup candidate session failed");
            return (candidate, Some(handle));
        }

        // Verify in the candidate's own clone so candidates never contend
        // for the integration workspace.
        let (passed, output) = run_shell(
            &handle.path,
            self.verification_command(),
            self.verification_timeout(),
        )
        .await;
        candidate.verification_passed = passed;
        let (tests_passed, lint_errors) = parse_verify_metrics(&output);
        candidate.tests_passed = tests_passed;
        candidate.lint_errors = lint_errors;

        if let Ok(stat) = git.diff_stat(&green_ref, "HEAD").await {
            candidate.diff_lines = count_diff_lines(&stat);
        }

        (candidate, Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        index: usize,
        passed: bool,
        tests: u32,
        lint: u32,
        diff: u32,
    ) -> FixupCandidate {
        FixupCandidate {
            index,
            branch: format!("mc/fixup-u-{}", index),
            verification_passed: passed,
            tests_passed: tests,
            lint_errors: lint,
            diff_lines: diff,
        }
    }

    #[test]
    fn tournament_prefers_tests_then_lint_then_diff() {
        // The documented scenario: (12, 0, 40), (12, 2, 20), (11, 0, 15).
        let candidates = vec![
            candidate(0, true, 12, 0, 40),
            candidate(1, true, 12, 2, 20),
            candidate(2, true, 11, 0, 15),
        ];
        let winner = select_winner(&candidates).unwrap();
        assert_eq!(winner.index, 0);
    }

    #[test]
    fn ties_break_by_submission_order() {
        let candidates = vec![
            candidate(0, true, 10, 1, 30),
            candidate(1, true, 10, 1, 30),
        ];
        assert_eq!(select_winner(&candidates).unwrap().index, 0);
    }

    #[test]
    fn failing_candidates_never_win() {
        let candidates = vec![
            candidate(0, false, 100, 0, 1),
            candidate(1, true, 1, 5, 500),
        ];
        assert_eq!(select_winner(&candidates).unwrap().index, 1);

        let all_failed = vec![candidate(0, false, 5, 0, 5)];
        assert!(select_winner(&all_failed).is_none());
    }

    #[test]
    fn metrics_parse_from_test_runner_output() {
        let output = "running 14 tests\n...\ntest result: ok. 14 passed; 0 failed\n";
        let (tests, lint) = parse_verify_metrics(output);
        assert_eq!(tests, 14);
        assert_eq!(lint, 0);

        let with_errors =
            "error[E0308]: mismatched types\nerror: aborting due to previous error\n2 passed";
        let (tests, lint) = parse_verify_metrics(with_errors);
        assert_eq!(tests, 2);
        assert_eq!(lint, 2);
    }

    #[test]
    fn diff_line_counting_matches_stat_footer() {
        let stat = " src/a.rs | 10 ++++++----\n src/b.rs |  5 +++--\n 2 files changed, 10 insertions(+), 5 deletions(-)\n";
        assert_eq!(count_diff_lines(stat), 15);
        assert_eq!(count_diff_lines("nothing here"), 0);
        assert_eq!(count_diff_lines(" 1 file changed, 3 insertions(+)\n"), 3);
    }
}
