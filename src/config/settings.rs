use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ForemanError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    pub target: TargetConfig,
    pub scheduler: SchedulerConfig,
    pub rounds: RoundsConfig,
    pub continuous: ContinuousConfig,
    pub green_branch: GreenBranchConfig,
    pub review: ReviewConfig,
    pub degradation: DegradationConfig,
    pub pricing: PricingConfig,
}

impl ForemanConfig {
    pub async fn load(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join("config.toml");
        let config: Self = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, state_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = state_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| ForemanError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.scheduler.parallel.num_workers == 0 {
            errors.push("scheduler.parallel.num_workers must be greater than 0");
        }
        if self.scheduler.parallel.warm_clones > self.scheduler.parallel.num_workers + 1 {
            errors.push("scheduler.parallel.warm_clones must not exceed num_workers + 1");
        }
        if self.scheduler.session_timeout_secs == 0 {
            errors.push("scheduler.session_timeout_secs must be greater than 0");
        }

        if self.target.verification.command.is_empty() {
            errors.push("target.verification.command must not be empty");
        }
        if self.target.verification.timeout_secs == 0 {
            errors.push("target.verification.timeout_secs must be greater than 0");
        }

        if self.rounds.max_rounds == 0 {
            errors.push("rounds.max_rounds must be greater than 0");
        }
        if self.rounds.stall_threshold == 0 {
            errors.push("rounds.stall_threshold must be greater than 0");
        }

        if self.continuous.max_units_per_epoch == 0 {
            errors.push("continuous.max_units_per_epoch must be greater than 0");
        }
        if !(0.0..=10.0).contains(&self.continuous.min_ambition_score) {
            errors.push("continuous.min_ambition_score must be between 0.0 and 10.0");
        }
        if self.continuous.max_consecutive_failures == 0 {
            errors.push("continuous.max_consecutive_failures must be greater than 0");
        }

        if self.green_branch.fixup_candidates == 0 {
            errors.push("green_branch.fixup_candidates must be greater than 0");
        }
        if self.green_branch.working_branch == self.green_branch.green_branch {
            errors.push("green_branch.working_branch and green_branch must differ");
        }
        if self.green_branch.push_batch_size == 0 {
            errors.push("green_branch.push_batch_size must be greater than 0");
        }

        if !(1.0..=10.0).contains(&self.review.min_review_score) {
            errors.push("review.min_review_score must be between 1.0 and 10.0");
        }

        if self.degradation.failure_threshold == 0 {
            errors.push("degradation.failure_threshold must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ForemanError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Source repository the mission operates on.
    pub path: PathBuf,
    /// Base ref that mc/working and mc/green bootstrap from.
    pub branch: String,
    pub verification: VerificationConfig,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            branch: "main".into(),
            verification: VerificationConfig::default(),
        }
    }
}

impl TargetConfig {
    /// State directory for the database, changelog, and config file.
    pub fn state_dir(&self) -> PathBuf {
        self.path.join(".foreman")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub command: String,
    pub timeout_secs: u64,
    /// Optional one-shot workspace preparation (e.g. `npm install`).
    pub setup_command: String,
    pub setup_timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            command: "cargo test".into(),
            timeout_secs: 300,
            setup_command: String::new(),
            setup_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub parallel: ParallelConfig,
    pub session_timeout_secs: u64,
    pub budget: BudgetConfig,
    /// Worker launcher program; receives the rendered prompt.
    pub command: String,
    pub model: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: ParallelConfig::default(),
            session_timeout_secs: 2700,
            budget: BudgetConfig::default(),
            command: "claude".into(),
            model: "claude-sonnet-4-5".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub num_workers: usize,
    /// Directory holding the shared-clone pool. Empty means a sibling of
    /// the target path.
    pub pool_dir: PathBuf,
    pub warm_clones: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            pool_dir: PathBuf::new(),
            warm_clones: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_per_session_usd: f64,
    pub max_per_run_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_per_session_usd: 2.0,
            max_per_run_usd: 25.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundsConfig {
    pub max_rounds: u32,
    pub stall_threshold: u32,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            stall_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuousConfig {
    pub max_wall_time_seconds: u64,
    pub max_units_per_epoch: usize,
    pub min_ambition_score: f64,
    pub max_replan_attempts: u32,
    pub verify_before_merge: bool,
    pub backlog_max_age_seconds: u64,
    pub max_consecutive_failures: u32,
    pub failure_backoff_seconds: u64,
    /// Base cooldown between epochs; scaled up when the budget tracker
    /// signals slow-down.
    pub cooldown_seconds: u64,
    /// Optional shell command probed after each epoch; exit 0 stops the
    /// mission with `objective_met`. Empty disables the probe.
    pub objective_command: String,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            max_wall_time_seconds: 4 * 3600,
            max_units_per_epoch: 6,
            min_ambition_score: 4.0,
            max_replan_attempts: 2,
            verify_before_merge: true,
            backlog_max_age_seconds: 3600,
            max_consecutive_failures: 3,
            failure_backoff_seconds: 60,
            cooldown_seconds: 5,
            objective_command: String::new(),
        }
    }
}

/// Behaviour when `auto_push` finds the upstream has diverged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoPushPolicy {
    Force,
    #[default]
    Abort,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GreenBranchConfig {
    pub working_branch: String,
    pub green_branch: String,
    pub auto_push: bool,
    pub push_branch: String,
    pub push_batch_size: u32,
    pub auto_push_policy: AutoPushPolicy,
    pub fixup_max_attempts: u32,
    pub fixup_candidates: usize,
    /// Reset mc/working and mc/green to the base branch at mission start.
    pub reset_on_init: bool,
}

impl Default for GreenBranchConfig {
    fn default() -> Self {
        Self {
            working_branch: "mc/working".into(),
            green_branch: "mc/green".into(),
            auto_push: false,
            push_branch: "main".into(),
            push_batch_size: 3,
            auto_push_policy: AutoPushPolicy::Abort,
            fixup_max_attempts: 2,
            fixup_candidates: 3,
            reset_on_init: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub enabled: bool,
    pub gate_completion: bool,
    pub min_review_score: f64,
    pub skip_when_criteria_passed: bool,
    pub command: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gate_completion: false,
            min_review_score: 5.0,
            skip_when_criteria_passed: true,
            command: "claude".into(),
            model: "claude-haiku-4-5".into(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 300,
        }
    }
}

/// Per-million token rates used when a worker reports usage but no cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_write_per_million: 3.75,
            cache_read_per_million: 0.30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = ForemanConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_collects_all_violations() {
        let mut config = ForemanConfig::default();
        config.scheduler.parallel.num_workers = 0;
        config.green_branch.fixup_candidates = 0;
        config.target.verification.command.clear();

        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("num_workers"));
        assert!(msg.contains("fixup_candidates"));
        assert!(msg.contains("verification.command"));
    }

    #[test]
    fn same_working_and_green_branch_rejected() {
        let mut config = ForemanConfig::default();
        config.green_branch.working_branch = "mc/green".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn push_policy_defaults_to_abort() {
        let config = GreenBranchConfig::default();
        assert_eq!(config.auto_push_policy, AutoPushPolicy::Abort);
        assert!(!config.auto_push);
    }

    #[tokio::test]
    async fn load_round_trips_through_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = ForemanConfig::default();
        config.scheduler.parallel.num_workers = 5;
        config.green_branch.auto_push_policy = AutoPushPolicy::Merge;
        config.save(dir.path()).await.unwrap();

        let loaded = ForemanConfig::load(dir.path()).await.unwrap();
        assert_eq!(loaded.scheduler.parallel.num_workers, 5);
        assert_eq!(loaded.green_branch.auto_push_policy, AutoPushPolicy::Merge);
    }
}
