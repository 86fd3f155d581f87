//! Step and promotion result types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::state::{State, StepExecutionMetadataList};

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step has not been attempted yet.
    #[default]
    Pending,
    /// Step is in progress or waiting on an external condition.
    Running,
    /// Step completed successfully.
    Succeeded,
    /// Step completed but its outcome was a failure.
    Failed,
    /// Step could not complete because of an error.
    Errored,
    /// Step was not executed.
    Skipped,
    /// Step was aborted.
    Aborted,
}

impl StepStatus {
    /// Whether a runner is allowed to report this status.
    pub fn is_valid_runner_status(&self) -> bool {
        !matches!(self, StepStatus::Pending)
    }

    /// Whether this status counts as a failure of the step.
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Errored)
    }

    /// Ordering used to compute the aggregate phase of a promotion.
    ///
    /// skipped < succeeded < aborted < failed < errored. `running` and
    /// `pending` never legitimately survive the main loop and rank with
    /// `errored`.
    pub fn severity(&self) -> u8 {
        match self {
            StepStatus::Skipped => 0,
            StepStatus::Succeeded => 1,
            StepStatus::Aborted => 2,
            StepStatus::Failed => 3,
            StepStatus::Errored | StepStatus::Running | StepStatus::Pending => 4,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Errored => write!(f, "errored"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// A follow-up health assessment requested by a step.
///
/// The engine only collects these; evaluating them is left to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckStep {
    /// Kind of health check to perform.
    pub uses: String,

    /// Health-check specific configuration.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

/// Result returned by a step runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Outcome reported by the runner.
    pub status: StepStatus,

    /// Output stored in the shared state under the step's alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Map<String, serde_json::Value>>,

    /// Optional follow-up health check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckStep>,

    /// Human readable detail about the outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StepResult {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn succeeded() -> Self {
        Self::new(StepStatus::Succeeded)
    }

    pub fn running() -> Self {
        Self::new(StepStatus::Running)
    }

    /// Set the step output.
    pub fn with_output(mut self, output: serde_json::Map<String, serde_json::Value>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheckStep) -> Self {
        self.health_check = Some(health_check);
        self
    }
}

/// Aggregate phase of a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionStatus {
    /// All steps succeeded or were skipped.
    Succeeded,
    /// Work remains; the caller should invoke the engine again later.
    Running,
    /// A step failed.
    Failed,
    /// A step errored or the engine hit a fatal error.
    Errored,
    /// A step aborted the promotion.
    Aborted,
}

impl PromotionStatus {
    /// Whether the promotion has reached a final phase.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PromotionStatus::Running)
    }

    /// Map the worst step outcome of a run onto a promotion phase.
    pub fn from_worst_step(status: StepStatus) -> Self {
        match status {
            StepStatus::Skipped | StepStatus::Succeeded => PromotionStatus::Succeeded,
            StepStatus::Aborted => PromotionStatus::Aborted,
            StepStatus::Failed => PromotionStatus::Failed,
            StepStatus::Errored | StepStatus::Running | StepStatus::Pending => {
                PromotionStatus::Errored
            }
        }
    }
}

impl std::fmt::Display for PromotionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromotionStatus::Succeeded => write!(f, "succeeded"),
            PromotionStatus::Running => write!(f, "running"),
            PromotionStatus::Failed => write!(f, "failed"),
            PromotionStatus::Errored => write!(f, "errored"),
            PromotionStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Result of one engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionResult {
    /// Aggregate phase.
    pub status: PromotionStatus,

    /// Explanation for any phase other than `succeeded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Index of the step in flight (or the last step).
    pub current_step: usize,

    /// Per-step execution records, ordered like the steps.
    pub step_execution_metadata: StepExecutionMetadataList,

    /// Outputs keyed by step alias.
    pub state: State,

    /// Health checks requested by steps that succeeded in this invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheckStep>,

    /// Working directory used by this invocation.
    #[serde(skip)]
    pub work_dir: PathBuf,

    /// Set when the engine created `work_dir` and the caller should remove it.
    #[serde(skip)]
    pub work_dir_created: bool,
}

impl PromotionResult {
    pub fn is_running(&self) -> bool {
        self.status == PromotionStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_display() {
        assert_eq!(StepStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(StepStatus::Errored.to_string(), "errored");
        assert_eq!(PromotionStatus::Running.to_string(), "running");
    }

    #[test]
    fn test_step_status_severity_order() {
        let ordered = [
            StepStatus::Skipped,
            StepStatus::Succeeded,
            StepStatus::Aborted,
            StepStatus::Failed,
            StepStatus::Errored,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].severity() < pair[1].severity());
        }
        assert_eq!(StepStatus::Running.severity(), StepStatus::Errored.severity());
    }

    #[test]
    fn test_promotion_status_from_worst_step() {
        assert_eq!(
            PromotionStatus::from_worst_step(StepStatus::Skipped),
            PromotionStatus::Succeeded
        );
        assert_eq!(
            PromotionStatus::from_worst_step(StepStatus::Running),
            PromotionStatus::Errored
        );
        assert_eq!(
            PromotionStatus::from_worst_step(StepStatus::Aborted),
            PromotionStatus::Aborted
        );
    }

    #[test]
    fn test_runner_status_validation() {
        assert!(!StepStatus::Pending.is_valid_runner_status());
        assert!(StepStatus::Running.is_valid_runner_status());
        assert!(StepStatus::Aborted.is_valid_runner_status());
    }

    #[test]
    fn test_step_result_serialization() {
        let mut output = serde_json::Map::new();
        output.insert("commit".to_string(), serde_json::json!("abc123"));
        let result = StepResult::succeeded().with_output(output);

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"status\":\"succeeded\""));
        assert!(json.contains("\"commit\":\"abc123\""));
        assert!(!json.contains("healthCheck"));
    }
}
