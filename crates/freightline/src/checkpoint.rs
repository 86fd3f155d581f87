//! Resumption point persisted by callers between engine invocations.

use serde::{Deserialize, Serialize};

use crate::context::PromotionContext;
use crate::result::PromotionResult;
use crate::state::{State, StepExecutionMetadataList};

/// Everything needed to resume a promotion after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionCheckpoint {
    /// Step to resume from.
    pub current_step: usize,

    /// Outputs keyed by step alias.
    #[serde(default)]
    pub state: State,

    /// Per-step execution records.
    #[serde(default)]
    pub step_execution_metadata: StepExecutionMetadataList,
}

impl PromotionCheckpoint {
    /// Capture the resumption point of an invocation.
    pub fn from_result(result: &PromotionResult) -> Self {
        Self {
            current_step: result.current_step,
            state: result.state.clone(),
            step_execution_metadata: result.step_execution_metadata.clone(),
        }
    }

    /// Feed the checkpoint into the context of the next invocation.
    pub fn apply(&self, ctx: &mut PromotionContext) {
        ctx.start_from_step = self.current_step;
        ctx.state = self.state.clone();
        ctx.step_execution_metadata = self.step_execution_metadata.clone();
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl From<&PromotionResult> for PromotionCheckpoint {
    fn from(result: &PromotionResult) -> Self {
        Self::from_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{PromotionStatus, StepStatus};
    use chrono::{TimeZone, Utc};

    fn result() -> PromotionResult {
        let mut metadata = StepExecutionMetadataList::new();
        let record = metadata.ensure(0, "clone");
        record.status = StepStatus::Succeeded;
        record.started_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        record.finished_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 3).unwrap());
        let record = metadata.ensure(1, "push");
        record.status = StepStatus::Running;
        record.error_count = 1;
        record.message = Some("will be retried".to_string());

        let mut state = State::new();
        state.set("clone", serde_json::json!({"commit": "abc123", "depth": 1}));

        PromotionResult {
            status: PromotionStatus::Running,
            message: None,
            current_step: 1,
            step_execution_metadata: metadata,
            state,
            health_checks: vec![],
            work_dir: std::env::temp_dir(),
            work_dir_created: false,
        }
    }

    #[test]
    fn test_checkpoint_json_roundtrip() {
        let checkpoint = PromotionCheckpoint::from_result(&result());
        let json = checkpoint.to_json().unwrap();
        assert!(json.contains("\"currentStep\": 1"));
        assert!(json.contains("\"stepExecutionMetadata\""));

        let restored = PromotionCheckpoint::from_json(&json).unwrap();
        assert_eq!(restored, checkpoint);
    }

    #[test]
    fn test_checkpoint_apply() {
        let checkpoint = PromotionCheckpoint::from(&result());
        let mut ctx = PromotionContext::new("demo", "prod", "prod.01");
        checkpoint.apply(&mut ctx);

        assert_eq!(ctx.start_from_step, 1);
        assert_eq!(ctx.state.get("clone").unwrap()["commit"], "abc123");
        assert_eq!(ctx.step_execution_metadata.get(1).unwrap().error_count, 1);
    }
}
