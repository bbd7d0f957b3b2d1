use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for MissionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown mission status: {}", other)),
        }
    }
}

/// Why the mission loop stopped. Drives the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ObjectiveMet,
    TimeBudget,
    MaxRounds,
    CostBudget,
    RepeatedTotalFailure,
    Stalled,
    Cancelled,
    InternalError,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectiveMet => "objective_met",
            Self::TimeBudget => "time_budget",
            Self::MaxRounds => "max_rounds",
            Self::CostBudget => "cost_budget",
            Self::RepeatedTotalFailure => "repeated_total_failure",
            Self::Stalled => "stalled",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal_error",
        }
    }

    /// Mission-driver exit code contract: 0 for met objectives and
    /// time-budget exits with progress, 1 for failure/stall, 2 for cost
    /// exhaustion, 64+ for internal errors.
    pub fn exit_code(&self, made_progress: bool) -> u8 {
        match self {
            Self::ObjectiveMet => 0,
            Self::TimeBudget | Self::MaxRounds if made_progress => 0,
            Self::TimeBudget | Self::MaxRounds => 1,
            Self::RepeatedTotalFailure | Self::Stalled | Self::Cancelled => 1,
            Self::CostBudget => 2,
            Self::InternalError => 64,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The top-level run. Created by the controller at start, mutated only by
/// the controller, terminal on stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub objective: String,
    pub verification_command: String,
    pub budget_usd: f64,
    pub wall_time_budget_secs: u64,
    pub status: MissionStatus,
    pub stop_reason: Option<StopReason>,
    pub total_cost_usd: f64,
    pub total_epochs: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Mission {
    pub fn new(objective: impl Into<String>, verification_command: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            objective: objective.into(),
            verification_command: verification_command.into(),
            budget_usd: 0.0,
            wall_time_budget_secs: 0,
            status: MissionStatus::Running,
            stop_reason: None,
            total_cost_usd: 0.0,
            total_epochs: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn with_budget(mut self, budget_usd: f64, wall_time_budget_secs: u64) -> Self {
        self.budget_usd = budget_usd;
        self.wall_time_budget_secs = wall_time_budget_secs;
        self
    }

    pub fn stop(&mut self, reason: StopReason) {
        self.status = match reason {
            StopReason::ObjectiveMet => MissionStatus::Completed,
            StopReason::InternalError => MissionStatus::Failed,
            _ => MissionStatus::Stopped,
        };
        self.stop_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }
}

/// One plan-dispatch-merge-feedback cycle within a mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub id: String,
    pub mission_id: String,
    pub ordinal: u32,
    pub planned_unit_ids: Vec<String>,
    pub dispatched_unit_ids: Vec<String>,
    pub ambition_score: f64,
    pub all_failed: bool,
    pub cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Epoch {
    pub fn new(mission_id: impl Into<String>, ordinal: u32) -> Self {
        Self {
            id: new_id(),
            mission_id: mission_id.into(),
            ordinal,
            planned_unit_ids: Vec::new(),
            dispatched_unit_ids: Vec::new(),
            ambition_score: 0.0,
            all_failed: false,
            cost_usd: 0.0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}
