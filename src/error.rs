use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("Mission not found: {0}")]
    MissionNotFound(String),

    #[error("Work unit not found: {mission_id}/{unit_id}")]
    UnitNotFound { mission_id: String, unit_id: String },

    #[error("Invalid unit state: expected {expected}, got {actual}")]
    InvalidUnitState { expected: String, actual: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Workspace error: {message}")]
    Workspace { message: String, path: PathBuf },

    #[error("Workspace pool exhausted (waited {waited_secs}s)")]
    PoolExhausted { waited_secs: u64 },

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Acceptance criteria failed: {0}")]
    AcceptanceFailed(String),

    #[error("Integration refs diverged: {0}")]
    RefsDiverged(String),

    #[error("Circuit open for component: {0}")]
    CircuitOpen(String),

    #[error("Worker execution failed: {0}")]
    WorkerExecution(String),

    #[error("Worker envelope parse failure: {0}")]
    EnvelopeParse(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Mission cancelled")]
    MissionCancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ForemanError {
    /// Transient failures are retried with backoff and recorded on the
    /// relevant circuit breaker; everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::PoolExhausted { .. })
    }

    /// Content failures escalate to fixup rather than abandoning the unit.
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            Self::MergeConflict(_) | Self::VerificationFailed(_) | Self::AcceptanceFailed(_)
        )
    }

    /// Integrity failures hard-stop the submission and trip the
    /// green_branch breaker.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::RefsDiverged(_) | Self::Git(_) | Self::Store(_) | Self::Workspace { .. }
        )
    }
}

pub fn store_err(msg: impl Into<String>) -> ForemanError {
    ForemanError::Store(msg.into())
}

pub fn store_err_with(msg: &str, e: impl std::fmt::Display) -> ForemanError {
    ForemanError::Store(format!("{}: {}", msg, e))
}

pub type Result<T> = std::result::Result<T, ForemanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint_for_common_kinds() {
        let conflict = ForemanError::MergeConflict("src/lib.rs".into());
        assert!(conflict.is_content());
        assert!(!conflict.is_transient());
        assert!(!conflict.is_integrity());

        let timeout = ForemanError::Timeout("verify".into());
        assert!(timeout.is_transient());
        assert!(!timeout.is_content());

        let diverged = ForemanError::RefsDiverged("mc/green".into());
        assert!(diverged.is_integrity());
        assert!(!diverged.is_content());
    }
}
