use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{PricingConfig, SchedulerConfig};
use crate::domain::WorkUnit;
use crate::error::{ForemanError, Result};

use super::envelope::{ResultEnvelope, parse_envelope};

/// Placeholder in the argument template replaced by the rendered prompt.
const PROMPT_SLOT: &str = "{prompt}";

/// Everything a backend needs to run one worker session.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub unit: WorkUnit,
    pub workspace: PathBuf,
    pub branch_name: String,
    pub prompt: String,
    pub timeout: Duration,
}

/// Pluggable worker launcher. The core treats workers as opaque commands
/// that return a structured envelope; local subprocess, remote, and
/// container backends all fit behind this seam.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    async fn spawn(&self, request: &WorkerRequest) -> Result<ResultEnvelope>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Launches the worker command as a local subprocess in the unit's
/// workspace clone.
pub struct LocalBackend {
    command: String,
    args: Vec<String>,
    pricing: PricingConfig,
}

impl LocalBackend {
    pub fn new(scheduler: &SchedulerConfig, pricing: PricingConfig) -> Self {
        Self {
            command: scheduler.command.clone(),
            args: vec![
                "-p".into(),
                "--output-format".into(),
                "text".into(),
                "--permission-mode".into(),
                "bypassPermissions".into(),
                "--model".into(),
                scheduler.model.clone(),
                "--max-budget-usd".into(),
                scheduler.budget.max_per_session_usd.to_string(),
                PROMPT_SLOT.into(),
            ],
            pricing: pricing.clone(),
        }
    }

    /// Custom launcher, e.g. a wrapper script. Any `{prompt}` argument is
    /// replaced by the rendered prompt.
    pub fn with_command(
        command: impl Into<String>,
        args: Vec<String>,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            pricing,
        }
    }

    fn resolved_args(&self, prompt: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                if a == PROMPT_SLOT {
                    prompt.to_string()
                } else {
                    a.clone()
                }
            })
            .collect()
    }
}

#[async_trait]
impl WorkerBackend for LocalBackend {
    async fn spawn(&self, request: &WorkerRequest) -> Result<ResultEnvelope> {
        debug!(
            unit_id = %request.unit.id,
            workspace = %request.workspace.display(),
            branch = %request.branch_name,
            "Spawning worker subprocess"
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(self.resolved_args(&request.prompt))
            .current_dir(&request.workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            ForemanError::WorkerExecution(format!("failed to launch {}: {}", self.command, e))
        })?;

        // kill_on_drop tears the subprocess down when the timeout drops
        // the wait future mid-flight.
        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| ForemanError::WorkerExecution(format!("worker wait failed: {}", e)))?,
            Err(_) => {
                warn!(
                    unit_id = %request.unit.id,
                    timeout_secs = request.timeout.as_secs(),
                    "Worker timed out, killed"
                );
                return Err(ForemanError::Timeout(format!(
                    "worker for unit {} after {}s",
                    request.unit.id,
                    request.timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let exit_status = output.status.code().unwrap_or(-1);
        if exit_status != 0 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                unit_id = %request.unit.id,
                exit_status,
                stderr = %stderr.chars().take(300).collect::<String>(),
                "Worker exited non-zero"
            );
        }

        Ok(parse_envelope(&stdout, exit_status, &self.pricing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::envelope::{ErrorKind, MC_RESULT_MARKER};

    fn shell_backend() -> LocalBackend {
        LocalBackend::with_command(
            "sh",
            vec!["-c".into(), PROMPT_SLOT.into()],
            PricingConfig::default(),
        )
    }

    fn request(script: &str, timeout: Duration) -> WorkerRequest {
        let unit = WorkUnit::new("m1", "e1", "noop");
        let branch_name = unit.branch_name.clone();
        WorkerRequest {
            unit,
            workspace: std::env::temp_dir(),
            branch_name,
            prompt: script.into(),
            timeout,
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_worker_execution_error() {
        let backend = LocalBackend::with_command(
            "definitely-not-a-real-binary-xyz",
            vec![PROMPT_SLOT.into()],
            PricingConfig::default(),
        );
        let err = backend
            .spawn(&request("x", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::WorkerExecution(_)));
    }

    #[tokio::test]
    async fn envelope_on_stdout_is_parsed() {
        let backend = shell_backend();
        let script = format!(
            "echo '{}{}'",
            MC_RESULT_MARKER,
            r#"{"status": "completed", "summary": "echoed", "cost_usd": 0.1}"#
        );

        let envelope = backend
            .spawn(&request(&script, Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(envelope.is_success());
        assert_eq!(envelope.summary, "echoed");
    }

    #[tokio::test]
    async fn nonzero_exit_with_no_envelope_is_parse_failure() {
        let backend = shell_backend();
        let envelope = backend
            .spawn(&request("echo broken; exit 3", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(envelope.exit_status, 3);
        assert_eq!(envelope.error_kind, Some(ErrorKind::ParseFailure));
        assert!(!envelope.is_success());
    }

    #[tokio::test]
    async fn hung_worker_times_out() {
        let backend = shell_backend();
        let err = backend
            .spawn(&request("sleep 30", Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::Timeout(_)));
    }
}
