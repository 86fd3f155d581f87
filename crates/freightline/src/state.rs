//! Shared promotion state and per-step execution records.
//!
//! `State` and `StepExecutionMetadataList` are the only data that outlive a
//! single engine invocation. Callers persist them (see
//! [`crate::checkpoint`]) and hand them back on the next invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::result::StepStatus;
use crate::step::alias_namespace;

/// Step outputs keyed by step alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(BTreeMap<String, serde_json::Value>);

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the output recorded under an alias.
    pub fn get(&self, alias: &str) -> Option<&serde_json::Value> {
        self.0.get(alias)
    }

    /// Set the output recorded under an alias, replacing any previous value.
    pub fn set(&mut self, alias: impl Into<String>, value: serde_json::Value) {
        self.0.insert(alias.into(), value);
    }

    /// Record a step's output.
    ///
    /// When the alias is namespaced (`<namespace>::<name>`) the output keys
    /// are also merged into the entry keyed by the bare namespace, so a task
    /// exposes one composite output.
    pub fn record_output(
        &mut self,
        alias: &str,
        output: serde_json::Map<String, serde_json::Value>,
    ) {
        if let Some(namespace) = alias_namespace(alias) {
            let entry = self
                .0
                .entry(namespace.to_string())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if !entry.is_object() {
                *entry = serde_json::Value::Object(serde_json::Map::new());
            }
            if let serde_json::Value::Object(composite) = entry {
                for (k, v) in &output {
                    composite.insert(k.clone(), v.clone());
                }
            }
        }
        self.0
            .insert(alias.to_string(), serde_json::Value::Object(output));
    }

    /// Outputs of the steps in a task namespace, keyed by the name part of
    /// their alias.
    pub fn task_outputs(&self, namespace: &str) -> serde_json::Map<String, serde_json::Value> {
        let prefix = format!("{}::", namespace);
        self.0
            .iter()
            .filter_map(|(alias, value)| {
                alias
                    .strip_prefix(&prefix)
                    .map(|name| (name.to_string(), value.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// State as a JSON object for expression environments.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, serde_json::Value)> for State {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Execution record of a single step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionMetadata {
    /// Alias of the step.
    pub alias: String,

    /// Failures of this step do not fail the promotion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_error: bool,

    /// Current status.
    #[serde(default)]
    pub status: StepStatus,

    /// Detail about the latest attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Consecutive failed attempts.
    #[serde(default)]
    pub error_count: u32,

    /// When the first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the step reached a final status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecutionMetadata {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            ..Default::default()
        }
    }

    /// Whether this record counts against the promotion.
    pub fn is_blocking_failure(&self) -> bool {
        !self.continue_on_error && self.status.is_failure()
    }
}

/// Execution records for all steps reached so far, ordered like the steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepExecutionMetadataList(Vec<StepExecutionMetadata>);

impl StepExecutionMetadataList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<&StepExecutionMetadata> {
        self.0.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut StepExecutionMetadata> {
        self.0.get_mut(index)
    }

    /// Get the record for a step index, creating it (and any missing records
    /// before it) on first use.
    pub fn ensure(&mut self, index: usize, alias: &str) -> &mut StepExecutionMetadata {
        while self.0.len() <= index {
            self.0.push(StepExecutionMetadata::default());
        }
        let record = &mut self.0[index];
        if record.alias.is_empty() {
            record.alias = alias.to_string();
        }
        record
    }

    /// Find a record by alias.
    pub fn by_alias(&self, alias: &str) -> Option<&StepExecutionMetadata> {
        self.0.iter().find(|m| m.alias == alias)
    }

    /// Whether any step that does not tolerate errors has failed or errored.
    pub fn has_failures(&self) -> bool {
        self.0.iter().any(StepExecutionMetadata::is_blocking_failure)
    }

    /// Worst outcome across all attempted steps.
    ///
    /// Failures of `continue_on_error` steps count as succeeded; records
    /// that were never attempted are ignored.
    pub fn worst_status(&self) -> StepStatus {
        self.0
            .iter()
            .filter(|m| m.status != StepStatus::Pending)
            .map(|m| {
                if m.continue_on_error
                    && matches!(
                        m.status,
                        StepStatus::Failed | StepStatus::Errored | StepStatus::Aborted
                    )
                {
                    StepStatus::Succeeded
                } else {
                    m.status
                }
            })
            .max_by_key(StepStatus::severity)
            .unwrap_or(StepStatus::Succeeded)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StepExecutionMetadata> {
        self.0.iter()
    }
}

impl From<Vec<StepExecutionMetadata>> for StepExecutionMetadataList {
    fn from(records: Vec<StepExecutionMetadata>) -> Self {
        Self(records)
    }
}
