//! LLM diff reviewer.
//!
//! The prompt template and the parser share `REVIEW_RESULT_MARKER` as
//! their one contract. Both sides derive from the single constant below:
//! the prompt interpolates it, the matcher is compiled from it. Drift
//! between the two sides historically produced silent 100% parse failure,
//! so neither side may restate the literal.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ReviewConfig;
use crate::domain::{ReviewRecord, WorkUnit};
use crate::worker::extract_json_object;

pub const REVIEW_RESULT_MARKER: &str = "REVIEW_RESULT:";

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Tolerate markdown emphasis and flexible spacing around the marker,
    // but derive the core token from the shared constant.
    let core = regex::escape(REVIEW_RESULT_MARKER.trim_end_matches(':'));
    Regex::new(&format!(r"(?i)[*`_~]*{}[*`_~]*\s*:\s*", core)).expect("static regex")
});

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("static regex"));

pub struct DiffReviewer {
    config: ReviewConfig,
}

impl DiffReviewer {
    pub fn new(config: ReviewConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Review a promoted unit's diff. Never blocks the pipeline: any
    /// failure returns an unparsed record (or None when disabled or the
    /// diff is empty).
    pub async fn review_unit(
        &self,
        unit: &WorkUnit,
        diff: &str,
        objective: &str,
    ) -> Option<ReviewRecord> {
        if !self.config.enabled {
            return None;
        }
        if diff.trim().is_empty() {
            debug!(unit_id = %unit.id, "Skipping review of empty diff");
            return None;
        }

        let prompt = build_review_prompt(unit, diff, objective);
        let output = match self.invoke_reviewer(&prompt).await {
            Some(output) => output,
            None => return None,
        };

        match parse_review_output(&output) {
            Some((alignment, approach, tests, notes)) => Some(ReviewRecord::parsed(
                &unit.id,
                &unit.mission_id,
                alignment,
                approach,
                tests,
                notes,
            )),
            None => {
                warn!(
                    unit_id = %unit.id,
                    output_len = output.len(),
                    tail = %output.chars().rev().take(200).collect::<String>().chars().rev().collect::<String>(),
                    "Could not parse review output, storing raw"
                );
                Some(ReviewRecord::unparsed(&unit.id, &unit.mission_id, output))
            }
        }
    }

    async fn invoke_reviewer(&self, prompt: &str) -> Option<String> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args([
            "--print",
            "--output-format",
            "text",
            "--model",
            &self.config.model,
            "--max-turns",
            "1",
            "-p",
            prompt,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "Failed to launch reviewer");
                return None;
            }
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(Ok(output)) => {
                warn!(code = ?output.status.code(), "Reviewer exited non-zero");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Reviewer wait failed");
                None
            }
            Err(_) => {
                warn!(timeout_secs = self.config.timeout_secs, "Reviewer timed out");
                None
            }
        }
    }
}

fn build_review_prompt(unit: &WorkUnit, diff: &str, objective: &str) -> String {
    format!(
        "You are a code reviewer evaluating a merged work unit's diff.\n\n\
         ## Mission Objective\n{objective}\n\n\
         ## Work Unit\n{description}\n\n\
         ## Git Diff\n```\n{diff}\n```\n\n\
         ## Instructions\n\
         Score each dimension 1-10:\n\
         1. **Alignment**: How well does this diff advance the mission objective?\n\
         2. **Approach**: Is the implementation clean, idiomatic, and maintainable?\n\
         3. **Tests**: Are the tests meaningful and covering real behavior?\n\n\
         Then provide a 1-2 sentence rationale.\n\n\
         ## Output Format\n\
         You MUST end your response with a single line:\n\
         {marker}{{\"alignment\": 7, \"approach\": 8, \"tests\": 6, \"notes\": \"summary\"}}\n",
        objective = objective,
        description = unit.description,
        diff = clip(diff, 8000),
        marker = REVIEW_RESULT_MARKER,
    )
}

fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Parse the trailing review block. Returns clamped scores and notes, or
/// None when no marker-bearing JSON is recoverable.
pub fn parse_review_output(output: &str) -> Option<(u8, u8, u8, String)> {
    let cleaned = ANSI_RE.replace_all(output, "").into_owned();

    // Search from the last marker occurrence; earlier ones may be the
    // model quoting the instructions back.
    let data = MARKER_RE
        .find_iter(&cleaned)
        .last()
        .and_then(|m| extract_json_object(&cleaned[m.end()..]))
        .filter(is_review_object)
        // Fall back to any review-shaped JSON object in the output.
        .or_else(|| extract_json_object(&cleaned).filter(is_review_object))?;

    let notes = data
        .get("notes")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .chars()
        .take(500)
        .collect();

    Some((
        clamp_score(data.get("alignment")),
        clamp_score(data.get("approach")),
        clamp_score(data.get("tests")),
        notes,
    ))
}

fn is_review_object(data: &Value) -> bool {
    data.is_object()
        && ["alignment", "approach", "tests"]
            .iter()
            .any(|k| data.get(k).is_some())
}

fn clamp_score(value: Option<&Value>) -> u8 {
    value
        .and_then(Value::as_i64)
        .map(|v| v.clamp(1, 10) as u8)
        .unwrap_or(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_review_block() {
        let output = format!(
            "The change looks solid.\n\n{}{}",
            REVIEW_RESULT_MARKER,
            r#"{"alignment": 8, "approach": 7, "tests": 9, "notes": "well tested"}"#
        );
        let (alignment, approach, tests, notes) = parse_review_output(&output).unwrap();
        assert_eq!((alignment, approach, tests), (8, 7, 9));
        assert_eq!(notes, "well tested");
    }

    #[test]
    fn scores_clamp_to_valid_range() {
        let output = format!(
            "{}{}",
            REVIEW_RESULT_MARKER,
            r#"{"alignment": 15, "approach": 0, "tests": -3, "notes": ""}"#
        );
        let (alignment, approach, tests, _) = parse_review_output(&output).unwrap();
        assert_eq!((alignment, approach, tests), (10, 1, 1));
    }

    #[test]
    fn missing_score_defaults_to_midpoint() {
        let output = format!("{}{}", REVIEW_RESULT_MARKER, r#"{"alignment": 9}"#);
        let (alignment, approach, tests, _) = parse_review_output(&output).unwrap();
        assert_eq!((alignment, approach, tests), (9, 5, 5));
    }

    #[test]
    fn tolerates_markdown_wrapped_marker() {
        let output = r#"**REVIEW_RESULT**: {"alignment": 6, "approach": 6, "tests": 4, "notes": "thin tests"}"#;
        let (alignment, _, tests, _) = parse_review_output(output).unwrap();
        assert_eq!(alignment, 6);
        assert_eq!(tests, 4);
    }

    #[test]
    fn last_marker_wins_over_quoted_instructions() {
        let output = format!(
            "The format is {}{{...}}. Here it is:\n{}{}",
            REVIEW_RESULT_MARKER,
            REVIEW_RESULT_MARKER,
            r#"{"alignment": 3, "approach": 4, "tests": 2, "notes": "weak"}"#
        );
        let (alignment, ..) = parse_review_output(&output).unwrap();
        assert_eq!(alignment, 3);
    }

    #[test]
    fn ansi_codes_are_stripped() {
        let output = format!(
            "\x1b[32m{}\x1b[0m{}",
            REVIEW_RESULT_MARKER,
            r#"{"alignment": 7, "approach": 7, "tests": 7, "notes": "fine"}"#
        );
        assert!(parse_review_output(&output).is_some());
    }

    #[test]
    fn garbage_output_does_not_parse() {
        assert!(parse_review_output("no review here").is_none());
        assert!(parse_review_output("").is_none());
        let wrong_json = format!("{}{}", REVIEW_RESULT_MARKER, r#"{"something": 1}"#);
        assert!(parse_review_output(&wrong_json).is_none());
    }

    #[test]
    fn prompt_carries_the_shared_marker() {
        let unit = WorkUnit::new("m1", "e1", "tighten parser");
        let prompt = build_review_prompt(&unit, "diff --git a/x b/x", "objective");
        assert!(prompt.contains(REVIEW_RESULT_MARKER));
    }
}
