//! Integration plane: the merge queue, the green branch manager, and the
//! N-of-M fixup tournament.

mod fixup;
mod green;
mod queue;

pub use fixup::{
    FIXUP_PROMPTS, FixupCandidate, FixupRun, count_diff_lines, parse_verify_metrics, select_winner,
};
pub use green::{
    GREEN_BRANCH_COMPONENT, GREEN_PUSH_REF, GreenBranchManager, MergeOutcome, PUSH_COMPONENT,
};
pub use queue::{MergeQueue, MergeSubmission};

use std::path::Path;
use std::time::Duration;

/// Clip a failure message for storage and changelog lines.
pub(crate) fn clip_failure(s: &str) -> String {
    green::truncate(s, 500)
}

/// Probe the objective command in the integration workspace.
pub(crate) async fn run_objective_probe(
    dir: &Path,
    command: &str,
    timeout: Duration,
) -> (bool, String) {
    green::run_shell(dir, command, timeout).await
}
