use crate::domain::WorkUnit;

use super::envelope::MC_RESULT_MARKER;

/// Render the fresh-start worker prompt for a unit. The closing-envelope
/// instruction interpolates `MC_RESULT_MARKER` so prompt and parser cannot
/// drift apart.
pub fn render_worker_prompt(
    unit: &WorkUnit,
    objective: &str,
    branch_name: &str,
    context: &str,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are a development worker on an autonomous mission.\n\n\
         ## Mission Objective\n{}\n\n\
         ## Your Work Unit\n{}\n",
        objective, unit.description
    ));

    if !unit.files_hint.is_empty() {
        prompt.push_str(&format!(
            "\nFiles you are expected to touch:\n{}\n",
            unit.files_hint
                .iter()
                .map(|f| format!("- {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if !unit.acceptance_criteria.is_empty() {
        prompt.push_str(&format!(
            "\nAcceptance criteria (each must exit 0 after your changes):\n{}\n",
            unit.acceptance_criteria
                .iter()
                .map(|c| format!("- `{}`", c))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if !unit.specialist_tag.is_empty() {
        prompt.push_str(&format!("\nSpecialist profile: {}\n", unit.specialist_tag));
    }

    if !context.is_empty() {
        prompt.push_str(&format!("\n## Context\n{}\n", context));
    }

    prompt.push_str(&format!(
        "\n## Instructions\n\
         Work in the current directory. Create and commit your changes on the\n\
         branch `{branch}` (it is already checked out). Keep the change focused\n\
         on this unit; do not touch unrelated files.\n\n\
         You MUST end your response with a single line:\n\
         {marker}{{\"status\": \"completed|failed|blocked\", \"summary\": \"...\", \
         \"files_changed\": [...], \"branch\": \"{branch}\", \"discoveries\": [...]}}\n",
        branch = branch_name,
        marker = MC_RESULT_MARKER,
    ));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_carries_the_envelope_marker() {
        let unit = WorkUnit::new("m1", "e1", "fix the flaky retry test")
            .with_files_hint(vec!["src/retry.rs".into()])
            .with_acceptance_criteria(vec!["cargo test retry".into()]);
        let prompt = render_worker_prompt(&unit, "stabilize CI", "mc/unit-1234", "");

        assert!(prompt.contains(MC_RESULT_MARKER));
        assert!(prompt.contains("mc/unit-1234"));
        assert!(prompt.contains("src/retry.rs"));
        assert!(prompt.contains("cargo test retry"));
        assert!(prompt.contains("stabilize CI"));
    }
}
