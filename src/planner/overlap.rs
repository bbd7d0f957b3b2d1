//! File-overlap rules for concurrent dispatch.
//!
//! Two units may not run in the same layer when their `files_hint` sets
//! overlap. A directory claim (path ending with '/') conflicts with any
//! path beneath it.

use std::collections::HashSet;

use crate::domain::WorkUnit;

/// Check whether two path specs overlap.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a_norm = a.trim_end_matches('/');
    let b_norm = b.trim_end_matches('/');

    if a_norm == b_norm {
        return true;
    }

    if a.ends_with('/') && is_under(b_norm, a_norm) {
        return true;
    }
    if b.ends_with('/') && is_under(a_norm, b_norm) {
        return true;
    }

    false
}

fn is_under(child: &str, parent: &str) -> bool {
    child
        .strip_prefix(parent)
        .is_some_and(|rest| rest.starts_with('/'))
}

pub fn files_overlap(a: &[String], b: &[String]) -> bool {
    a.iter().any(|pa| b.iter().any(|pb| paths_overlap(pa, pb)))
}

/// Fraction of `hint` paths overlapped by the `merged` set. Used by the
/// staleness rule: a queued unit whose hints are mostly already-merged
/// territory needs a replan, not a dispatch.
pub fn overlap_ratio(hint: &[String], merged: &HashSet<String>) -> f64 {
    if hint.is_empty() {
        return 0.0;
    }
    let overlapping = hint
        .iter()
        .filter(|h| merged.iter().any(|m| paths_overlap(h, m)))
        .count();
    overlapping as f64 / hint.len() as f64
}

/// Split a topological layer into (dispatch now, defer to next layer):
/// a unit whose hints intersect an earlier-submitted unit in the same
/// layer defers.
pub fn partition_layer_by_overlap(units: Vec<WorkUnit>) -> (Vec<WorkUnit>, Vec<WorkUnit>) {
    let mut dispatch: Vec<WorkUnit> = Vec::new();
    let mut deferred: Vec<WorkUnit> = Vec::new();

    for unit in units {
        let conflicts = dispatch
            .iter()
            .any(|earlier| files_overlap(&earlier.files_hint, &unit.files_hint));
        if conflicts {
            deferred.push(unit);
        } else {
            dispatch.push(unit);
        }
    }

    (dispatch, deferred)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_with_files(id: &str, files: &[&str]) -> WorkUnit {
        let mut u = WorkUnit::new("m", "e", id)
            .with_files_hint(files.iter().map(|f| f.to_string()).collect());
        u.id = id.to_string();
        u
    }

    #[test]
    fn exact_and_trailing_slash_matches() {
        assert!(paths_overlap("src/foo.py", "src/foo.py"));
        assert!(paths_overlap("src/dir", "src/dir/"));
        assert!(!paths_overlap("src/foo.py", "src/bar.py"));
    }

    #[test]
    fn directory_claim_covers_children() {
        assert!(paths_overlap("src/", "src/foo.py"));
        assert!(paths_overlap("src/deep/file.rs", "src/"));
        assert!(!paths_overlap("src/", "srcx/foo.py"));
        assert!(!paths_overlap("src/foo.py", "src/foo.py.bak"));
    }

    #[test]
    fn plain_prefix_is_not_a_claim() {
        // Without the trailing slash, "src" is a file path, not a claim
        // over the directory.
        assert!(!paths_overlap("src", "src/foo.py"));
    }

    #[test]
    fn overlap_ratio_counts_hint_fraction() {
        let hint = vec!["src/a.rs".to_string(), "src/b.rs".to_string()];
        let merged: HashSet<String> =
            ["src/a.rs".to_string(), "src/other.rs".to_string()].into();
        assert!((overlap_ratio(&hint, &merged) - 0.5).abs() < f64::EPSILON);
        assert_eq!(overlap_ratio(&[], &merged), 0.0);
    }

    #[test]
    fn later_submitted_unit_defers() {
        let x = unit_with_files("x", &["src/foo.py"]);
        let y = unit_with_files("y", &["src/foo.py"]);
        let z = unit_with_files("z", &["src/bar.py"]);

        let (dispatch, deferred) = partition_layer_by_overlap(vec![x, y, z]);
        let dispatched: Vec<&str> = dispatch.iter().map(|u| u.id.as_str()).collect();
        let deferred_ids: Vec<&str> = deferred.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(dispatched, vec!["x", "z"]);
        assert_eq!(deferred_ids, vec!["y"]);
    }

    #[test]
    fn no_hints_never_conflicts() {
        let a = unit_with_files("a", &[]);
        let b = unit_with_files("b", &[]);
        let (dispatch, deferred) = partition_layer_by_overlap(vec![a, b]);
        assert_eq!(dispatch.len(), 2);
        assert!(deferred.is_empty());
    }
}
