//! Promotion and step execution contexts.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::freight::{FreightCollection, FreightRequest, TargetFreight};
use crate::state::{State, StepExecutionMetadataList};
use crate::step::ExpressionVariable;

/// Secrets by name, each a map of key to value.
pub type Secrets = BTreeMap<String, BTreeMap<String, String>>;

/// Everything an engine invocation knows about the promotion it runs.
///
/// Built fresh by the caller for every invocation, typically from a
/// promotion document plus the checkpoint of the previous invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionContext {
    /// Project the promotion belongs to.
    pub project: String,

    /// Stage receiving the Freight.
    pub stage: String,

    /// Name of the promotion.
    pub promotion: String,

    /// User or controller that requested the promotion.
    #[serde(default)]
    pub actor: String,

    /// Base URL of the UI, for links in step output.
    #[serde(default, rename = "uiBaseURL")]
    pub ui_base_url: String,

    /// Working directory; created by the engine when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    /// Freight requested by the stage.
    #[serde(default)]
    pub freight_requests: Vec<FreightRequest>,

    /// All Freight resolved for the promotion.
    #[serde(default)]
    pub freight: FreightCollection,

    /// Freight being promoted.
    #[serde(default)]
    pub target_freight_ref: TargetFreight,

    /// Index of the first step to execute.
    #[serde(default)]
    pub start_from_step: usize,

    /// Outputs accumulated by previous invocations.
    #[serde(default)]
    pub state: State,

    /// Execution records accumulated by previous invocations.
    #[serde(default)]
    pub step_execution_metadata: StepExecutionMetadataList,

    /// Promotion-level variables.
    #[serde(default)]
    pub vars: Vec<ExpressionVariable>,

    /// Secrets supplied by the caller; overlaid on resolved project secrets.
    #[serde(default, skip_serializing)]
    pub secrets: Secrets,
}

impl PromotionContext {
    /// Create a new promotion context.
    pub fn new(
        project: impl Into<String>,
        stage: impl Into<String>,
        promotion: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            stage: stage.into(),
            promotion: promotion.into(),
            ..Default::default()
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push(ExpressionVariable::new(name, value));
        self
    }

    /// Set a single secret value.
    pub fn set_secret(
        &mut self,
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.secrets
            .entry(name.into())
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Resume from a step, carrying over state from a previous invocation.
    pub fn resume_from(
        mut self,
        step: usize,
        state: State,
        metadata: StepExecutionMetadataList,
    ) -> Self {
        self.start_from_step = step;
        self.state = state;
        self.step_execution_metadata = metadata;
        self
    }
}

/// What a runner sees while executing one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Alias of the step.
    pub alias: String,

    /// Working directory shared by all steps of the invocation.
    pub work_dir: PathBuf,

    /// Fully resolved step configuration.
    pub config: serde_json::Value,

    /// Outputs of previous steps.
    pub shared_state: State,

    pub project: String,
    pub stage: String,
    pub promotion: String,
    pub actor: String,
    pub ui_base_url: String,

    pub freight_requests: Vec<FreightRequest>,
    pub freight: FreightCollection,
    pub target_freight_ref: TargetFreight,

    /// Cancelled when the caller abandons the promotion.
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Deserialize the resolved configuration into a runner specific type.
    pub fn config_as<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        let config = if self.config.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.config.clone()
        };
        Ok(serde_json::from_value(config)?)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
