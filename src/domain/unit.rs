use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::new_id;

/// Work unit lifecycle. Monotonic modulo retry: a retry records a new
/// attempt, it never rewinds the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Dispatched,
    Merged,
    RolledBack,
    Rejected,
    Stale,
    Completed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Stale)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Merged => "merged",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
            Self::Stale => "stale",
            Self::Completed => "completed",
        }
    }

    /// Legal forward transitions. Retry goes rolled_back -> dispatched with
    /// a fresh attempt record. dispatched -> completed covers units that
    /// finish with nothing to merge (idempotent re-merges, research units).
    pub fn can_transition_to(&self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Pending, Stale)
                | (Pending, Rejected)
                | (Dispatched, Merged)
                | (Dispatched, Completed)
                | (Dispatched, RolledBack)
                | (Dispatched, Rejected)
                | (Merged, Completed)
                | (Merged, RolledBack)
                | (RolledBack, Dispatched)
                | (RolledBack, Rejected)
        )
    }
}

impl std::str::FromStr for UnitState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "merged" => Ok(Self::Merged),
            "rolled_back" => Ok(Self::RolledBack),
            "rejected" => Ok(Self::Rejected),
            "stale" => Ok(Self::Stale),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown unit state: {}", other)),
        }
    }
}

/// A dispatchable task within an epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub mission_id: String,
    pub epoch_id: String,
    pub description: String,
    /// Paths this unit is expected to touch; drives file-overlap exclusion.
    #[serde(default)]
    pub files_hint: Vec<String>,
    /// Unit ids that must complete before this one dispatches.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Shell commands that must exit 0 after merge.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Opaque selector for the worker prompt profile.
    #[serde(default)]
    pub specialist_tag: String,
    #[serde(default)]
    pub needs_research: bool,
    pub state: UnitState,
    pub attempt_count: u32,
    pub branch_name: String,
    #[serde(default)]
    pub last_failure_reason: String,
    pub queued_at: DateTime<Utc>,
    /// Monotonic queue age in milliseconds relative to mission start; used
    /// for staleness checks that must not go backwards under clock skew.
    pub queued_at_monotonic_ms: u64,
}

impl WorkUnit {
    pub fn new(
        mission_id: impl Into<String>,
        epoch_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let id = new_id();
        let branch_name = format!("mc/unit-{}", id);
        Self {
            id,
            mission_id: mission_id.into(),
            epoch_id: epoch_id.into(),
            description: description.into(),
            files_hint: Vec::new(),
            depends_on: Vec::new(),
            acceptance_criteria: Vec::new(),
            specialist_tag: String::new(),
            needs_research: false,
            state: UnitState::Pending,
            attempt_count: 0,
            branch_name,
            last_failure_reason: String::new(),
            queued_at: Utc::now(),
            queued_at_monotonic_ms: 0,
        }
    }

    pub fn with_files_hint(mut self, files: Vec<String>) -> Self {
        self.files_hint = files;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn with_specialist_tag(mut self, tag: impl Into<String>) -> Self {
        self.specialist_tag = tag.into();
        self
    }

    /// Apply a state transition, rejecting anything outside the legality
    /// matrix. All production transitions go through here.
    pub fn transition_to(&mut self, next: UnitState) -> crate::error::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(crate::error::ForemanError::InvalidUnitState {
                expected: next.as_str().to_string(),
                actual: self.state.as_str().to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Persistent cross-mission work candidate. Owned by the planner; the core
/// reads it when building epoch plans and applies staleness rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogItem {
    pub id: String,
    pub description: String,
    pub impact: f64,
    pub effort: f64,
    pub attempt_count: u32,
    pub pinned_score: Option<f64>,
    #[serde(default)]
    pub last_failure: String,
    #[serde(default)]
    pub files_hint: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl BacklogItem {
    pub fn new(description: impl Into<String>, impact: f64, effort: f64) -> Self {
        Self {
            id: new_id(),
            description: description.into(),
            impact,
            effort,
            attempt_count: 0,
            pinned_score: None,
            last_failure: String::new(),
            files_hint: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Planner ordering score: pinned wins, otherwise impact per effort.
    pub fn score(&self) -> f64 {
        self.pinned_score
            .unwrap_or_else(|| self.impact / self.effort.max(0.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_state_transitions_are_forward_only() {
        use UnitState::*;
        assert!(Pending.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(Merged));
        assert!(Dispatched.can_transition_to(Completed));
        assert!(Merged.can_transition_to(Completed));
        assert!(Merged.can_transition_to(RolledBack));
        assert!(RolledBack.can_transition_to(Dispatched));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Merged.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Dispatched));
        assert!(!Stale.can_transition_to(Dispatched));
    }

    #[test]
    fn transition_to_enforces_the_matrix() {
        let mut unit = WorkUnit::new("m1", "e1", "enforced");
        unit.transition_to(UnitState::Dispatched).unwrap();
        unit.transition_to(UnitState::Merged).unwrap();
        unit.transition_to(UnitState::Completed).unwrap();

        let err = unit.transition_to(UnitState::Dispatched).unwrap_err();
        assert!(err.to_string().contains("Invalid unit state"));
        assert_eq!(unit.state, UnitState::Completed);
    }

    #[test]
    fn unit_branch_name_derives_from_id() {
        let unit = WorkUnit::new("m1", "e1", "add parser tests");
        assert_eq!(unit.branch_name, format!("mc/unit-{}", unit.id));
        assert_eq!(unit.state, UnitState::Pending);
        assert_eq!(unit.attempt_count, 0);
    }

    #[test]
    fn backlog_score_prefers_pin() {
        let mut item = BacklogItem::new("refactor config", 8.0, 2.0);
        assert!((item.score() - 4.0).abs() < f64::EPSILON);

        item.pinned_score = Some(99.0);
        assert!((item.score() - 99.0).abs() < f64::EPSILON);
    }

    #[test]
    fn backlog_score_guards_zero_effort() {
        let item = BacklogItem::new("tiny fix", 5.0, 0.0);
        assert!(item.score().is_finite());
    }
}
